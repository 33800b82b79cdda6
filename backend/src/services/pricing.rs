//! # Pricing
//!
//! Pure money arithmetic: item prices, addon validation, resize quotes and
//! refund amounts. Everything here is integer cents; floats only appear as
//! ratios and are rounded back to cents at the edge.
//!
//! ## Refund curve
//!
//! ```text
//! ratio
//! 1.0 ┤●───────╮
//!     │         ╲            points are linearly interpolated;
//! 0.5 ┤          ●──╮        before the first point its ratio holds,
//!     │              ╲       after the last point its ratio holds
//! 0.0 ┤               ●─────
//!     └──┬────────┬────┬──── elapsed %
//!        0       50   80
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::settings::{RefundCurvePoint, RefundPolicy, ResizePolicy, ResizePriceMode, Rounding};
use crate::db::{AddonRange, BillingCycle, CartSpec, Id, Package, PlanGroup, VpsInstance};
use crate::errors::{BrokerError, BrokerResult};
use crate::utils::SpecDoc;

// ============================================
// ROUNDING
// ============================================

/// Divide with the given rounding. `den` must be positive.
fn div_round(num: i128, den: i128, rounding: Rounding) -> i64 {
    let quot = num / den;
    let rem = num % den;
    let adjusted = if rem == 0 {
        quot
    } else {
        match rounding {
            Rounding::Floor => {
                if num < 0 {
                    quot - 1
                } else {
                    quot
                }
            }
            Rounding::Ceil => {
                if num > 0 {
                    quot + 1
                } else {
                    quot
                }
            }
            Rounding::Nearest => {
                if rem.abs() * 2 >= den {
                    quot + num.signum()
                } else {
                    quot
                }
            }
        }
    };
    adjusted as i64
}

/// `cents × remaining / total` rounded to cents.
pub fn prorate(cents: i64, remaining: i64, total: i64, rounding: Rounding) -> i64 {
    if total <= 0 || remaining <= 0 {
        return 0;
    }
    div_round(i128::from(cents) * i128::from(remaining), i128::from(total), rounding)
}

/// Round a fractional cent amount half away from zero.
pub fn round_cents(value: f64) -> i64 {
    value.round() as i64
}

// ============================================
// ITEM PRICE
// ============================================

/// Monthly cost of the addons in `spec`.
pub fn addon_price(plan: &PlanGroup, spec: &CartSpec) -> i64 {
    i64::from(spec.add_cores) * plan.unit_core
        + i64::from(spec.add_mem_gb) * plan.unit_mem
        + i64::from(spec.add_disk_gb) * plan.unit_disk
        + i64::from(spec.add_bw_mbps) * plan.unit_bw
}

fn validate_addon_value(name: &str, value: i32, range: &AddonRange) -> BrokerResult<()> {
    if value < 0 {
        return Err(BrokerError::invalid(format!("{} must not be negative", name)));
    }
    if range.min == -1 {
        if value != 0 {
            return Err(BrokerError::invalid(format!("{} is not available for this plan", name)));
        }
        return Ok(());
    }
    if value == 0 {
        return Ok(());
    }
    if range.min > 0 && value < range.min {
        return Err(BrokerError::invalid(format!("{} below minimum {}", name, range.min)));
    }
    if range.max > 0 && value > range.max {
        return Err(BrokerError::invalid(format!("{} above maximum {}", name, range.max)));
    }
    let step = if range.step <= 0 { 1 } else { range.step };
    if value % step != 0 {
        return Err(BrokerError::invalid(format!("{} must be a multiple of {}", name, step)));
    }
    Ok(())
}

/// Check every addon of `spec` against the plan's ranges.
pub fn validate_addons(spec: &CartSpec, plan: &PlanGroup) -> BrokerResult<()> {
    if spec.cycle_qty < 0 {
        return Err(BrokerError::invalid("cycle_qty must not be negative"));
    }
    validate_addon_value("add_cores", spec.add_cores, &plan.add_core)?;
    validate_addon_value("add_mem_gb", spec.add_mem_gb, &plan.add_mem)?;
    validate_addon_value("add_disk_gb", spec.add_disk_gb, &plan.add_disk)?;
    validate_addon_value("add_bw_mbps", spec.add_bw_mbps, &plan.add_bw)?;
    Ok(())
}

/// Price of one item and the months it buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPrice {
    pub amount: i64,
    pub months: i32,
}

/// `(monthly + addons) × cycle multiplier`, half away from zero.
///
/// Without a billing cycle the item buys one month at multiplier 1.
pub fn price_item(
    package: &Package,
    plan: &PlanGroup,
    cycle: Option<&BillingCycle>,
    spec: &CartSpec,
) -> BrokerResult<ItemPrice> {
    validate_addons(spec, plan)?;
    let monthly = package.monthly_price + addon_price(plan, spec);

    let Some(cycle) = cycle else {
        return Ok(ItemPrice { amount: monthly, months: 1 });
    };
    if !cycle.active {
        return Err(BrokerError::invalid(format!("billing cycle {} is not active", cycle.id)));
    }
    let qty = spec.cycle_qty.max(1);
    if cycle.min_qty > 0 && qty < cycle.min_qty {
        return Err(BrokerError::invalid(format!("cycle_qty below minimum {}", cycle.min_qty)));
    }
    if cycle.max_qty > 0 && qty > cycle.max_qty {
        return Err(BrokerError::invalid(format!("cycle_qty above maximum {}", cycle.max_qty)));
    }
    let amount = div_round(
        i128::from(monthly) * i128::from(cycle.multiplier_bp) * i128::from(qty),
        10_000,
        Rounding::Nearest,
    );
    Ok(ItemPrice {
        amount,
        months: cycle.months.max(1) * qty,
    })
}

// ============================================
// BILLING PERIOD
// ============================================

/// The instance's current billing period.
///
/// Taken from the item spec document (`current_period_*` and legacy keys, the end
/// defaulting to `expire_at`), else `created_at → expire_at` while the
/// instance has not expired.
pub fn current_period(inst: &VpsInstance, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (start, end) = inst.spec.current_period();
    if let (Some(start), Some(end)) = (start, end.or(inst.expire_at)) {
        return Some((start, end));
    }
    match inst.expire_at {
        Some(expire_at) if expire_at > now => Some((inst.created_at, expire_at)),
        _ => None,
    }
}

/// Remaining fraction of the period in `[0, 1]`.
pub fn remaining_ratio(inst: &VpsInstance, now: DateTime<Utc>) -> f64 {
    let Some((start, end)) = current_period(inst, now) else {
        return 0.0;
    };
    let total = (end - start).num_milliseconds();
    let remaining = (end - now).num_milliseconds();
    if total <= 0 || remaining <= 0 {
        return 0.0;
    }
    (remaining as f64 / total as f64).clamp(0.0, 1.0)
}

fn remaining_and_total_secs(inst: &VpsInstance, now: DateTime<Utc>) -> Option<(i64, i64)> {
    let (start, end) = current_period(inst, now)?;
    let total = (end - start).num_seconds();
    let remaining = (end - now).num_seconds();
    if total <= 0 || remaining <= 0 {
        return None;
    }
    Some((remaining.min(total), total))
}

// ============================================
// REFUND CURVE
// ============================================

/// Drop negative percents, clamp ratios to `[0, 1]`, keep the last ratio
/// given for a percent, sort ascending.
pub fn normalize_curve(points: Vec<RefundCurvePoint>) -> Vec<RefundCurvePoint> {
    let mut out: Vec<RefundCurvePoint> = Vec::with_capacity(points.len());
    for point in points {
        if !point.percent.is_finite() || point.percent < 0.0 {
            continue;
        }
        let ratio = if point.ratio.is_finite() {
            point.ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        match out.iter_mut().find(|p| p.percent == point.percent) {
            Some(existing) => existing.ratio = ratio,
            None => out.push(RefundCurvePoint {
                percent: point.percent,
                ratio,
            }),
        }
    }
    out.sort_by(|a, b| a.percent.total_cmp(&b.percent));
    out
}

/// Refund ratio at `elapsed_percent`; `None` for an empty curve.
pub fn curve_ratio(points: &[RefundCurvePoint], elapsed_percent: f64) -> Option<f64> {
    let first = points.first()?;
    let elapsed = elapsed_percent.max(0.0);
    if elapsed <= first.percent {
        return Some(first.ratio.clamp(0.0, 1.0));
    }
    for pair in points.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if elapsed <= next.percent {
            let span = next.percent - prev.percent;
            if span <= 0.0 {
                return Some(next.ratio.clamp(0.0, 1.0));
            }
            let t = (elapsed - prev.percent) / span;
            return Some((prev.ratio + t * (next.ratio - prev.ratio)).clamp(0.0, 1.0));
        }
    }
    points.last().map(|p| p.ratio.clamp(0.0, 1.0))
}

/// Elapsed share of the billing period, `1.0` when unknown.
pub fn elapsed_ratio(inst: &VpsInstance, now: DateTime<Utc>) -> f64 {
    match current_period(inst, now) {
        Some(_) => 1.0 - remaining_ratio(inst, now),
        None => 1.0,
    }
}

/// Threshold in hours; hours win over days.
fn threshold_hours(hours: i64, days: i64) -> Option<f64> {
    if hours > 0 {
        Some(hours as f64)
    } else if days > 0 {
        Some(days as f64 * 24.0)
    } else {
        None
    }
}

/// Refund owed for `basis` cents on `inst` at `now`.
///
/// A configured curve overrides the threshold table. A non-positive basis
/// or an expired instance yields zero.
pub fn refund_amount(inst: &VpsInstance, basis: i64, policy: &RefundPolicy, now: DateTime<Utc>) -> i64 {
    if basis <= 0 {
        return 0;
    }
    if matches!(inst.expire_at, Some(at) if at <= now) {
        return 0;
    }
    let elapsed = elapsed_ratio(inst, now);
    if let Some(ratio) = policy.curve.as_deref().and_then(|c| curve_ratio(c, elapsed * 100.0)) {
        return round_cents(basis as f64 * ratio);
    }

    let full = threshold_hours(policy.full_hours, policy.full_days);
    let prorate = threshold_hours(policy.prorate_hours, policy.prorate_days);
    let no_refund = threshold_hours(policy.no_refund_hours, policy.no_refund_days);

    // With a known period, age and thresholds are shares of it; otherwise
    // they are plain hours since creation.
    let (age, full, prorate, no_refund) = match current_period(inst, now) {
        Some((start, end)) => {
            let total_hours = (end - start).num_seconds() as f64 / 3600.0;
            if total_hours <= 0.0 {
                return 0;
            }
            let share = |hours: Option<f64>| hours.map(|h| (h / total_hours).min(1.0));
            (elapsed, share(full), share(prorate), share(no_refund))
        }
        None => {
            let age = (now - inst.created_at).num_seconds().max(0) as f64 / 3600.0;
            (age, full, prorate, no_refund)
        }
    };

    if matches!(no_refund, Some(limit) if age > limit) {
        return 0;
    }
    if matches!(full, Some(limit) if age <= limit) {
        return basis;
    }
    if let Some(limit) = prorate {
        if age <= limit && limit > 0.0 {
            return round_cents(basis as f64 * (limit - age) / limit);
        }
    }
    0
}

// ============================================
// RESIZE QUOTE
// ============================================

/// Priced capacity change for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResizeQuote {
    /// Signed delta: positive is owed by the user, negative is a credit.
    pub charge_amount: i64,
    /// Credit paid out after `min_refund`; zero when nothing is returned.
    pub refund_amount: i64,
    pub refund_to_wallet: bool,
    pub target_package_id: Id,
    pub target_cpu: i32,
    pub target_mem_gb: i32,
    pub target_disk_gb: i32,
    pub target_bw_mbps: i32,
    pub target_monthly: i64,
    pub current_monthly: i64,
}

impl ResizeQuote {
    /// Amount the resize order bills; never negative.
    pub fn order_total(&self) -> i64 {
        self.charge_amount.max(0)
    }

    /// Item spec carried by the resize order.
    pub fn to_spec(&self, vps_id: Id, target: &CartSpec) -> SpecDoc {
        let mut spec = SpecDoc::new();
        spec.set("vps_id", vps_id)
            .set("spec", serde_json::to_value(target).unwrap_or_default())
            .set("target_package_id", self.target_package_id)
            .set("target_cpu", self.target_cpu)
            .set("target_mem_gb", self.target_mem_gb)
            .set("target_disk_gb", self.target_disk_gb)
            .set("target_bw_mbps", self.target_bw_mbps)
            .set("target_monthly", self.target_monthly)
            .set("charge_amount", self.charge_amount)
            .set("refund_amount", self.refund_amount)
            .set("refund_to_wallet", self.refund_to_wallet);
        spec
    }
}

/// Everything a resize quote is computed from.
pub struct ResizeInputs<'a> {
    pub instance: &'a VpsInstance,
    pub current_package: &'a Package,
    pub target_package: &'a Package,
    pub plan: &'a PlanGroup,
    pub current_spec: &'a CartSpec,
    pub target_spec: &'a CartSpec,
    pub policy: &'a ResizePolicy,
    pub now: DateTime<Utc>,
}

/// Price a resize.
///
/// Fails with `invalid_input` for a cross-plan package, a disk shrink or
/// bad addons, and with `resize_same_plan` when nothing would change.
pub fn quote_resize(inputs: ResizeInputs<'_>) -> BrokerResult<ResizeQuote> {
    let ResizeInputs {
        instance,
        current_package,
        target_package,
        plan,
        current_spec,
        target_spec,
        policy,
        now,
    } = inputs;

    if target_package.plan_group_id != current_package.plan_group_id {
        return Err(BrokerError::invalid("target package belongs to another plan group"));
    }
    validate_addons(target_spec, plan)?;

    let current_monthly = current_package.monthly_price + addon_price(plan, current_spec);
    let target_monthly = target_package.monthly_price + addon_price(plan, target_spec);

    let current = (
        current_package.cpu + current_spec.add_cores,
        current_package.memory_gb + current_spec.add_mem_gb,
        current_package.disk_gb + current_spec.add_disk_gb,
        current_package.bandwidth_mbps + current_spec.add_bw_mbps,
    );
    let target = (
        target_package.cpu + target_spec.add_cores,
        target_package.memory_gb + target_spec.add_mem_gb,
        target_package.disk_gb + target_spec.add_disk_gb,
        target_package.bandwidth_mbps + target_spec.add_bw_mbps,
    );
    if target.2 < current.2 {
        return Err(BrokerError::invalid("disk cannot shrink"));
    }
    if target == current {
        return Err(BrokerError::ResizeSamePlan);
    }

    let diff = target_monthly - current_monthly;
    let charge = match policy.price_mode {
        ResizePriceMode::Full => diff,
        ResizePriceMode::Remaining => match remaining_and_total_secs(instance, now) {
            Some((remaining, total)) if diff != 0 => prorate(diff, remaining, total, policy.rounding),
            _ => 0,
        },
    };

    let mut quote = ResizeQuote {
        charge_amount: charge,
        refund_amount: 0,
        refund_to_wallet: policy.refund_to_wallet,
        target_package_id: if target_package.id != current_package.id {
            target_package.id
        } else {
            0
        },
        target_cpu: target.0,
        target_mem_gb: target.1,
        target_disk_gb: target.2,
        target_bw_mbps: target.3,
        target_monthly,
        current_monthly,
    };
    if charge > 0 && policy.min_charge > 0 && charge < policy.min_charge {
        quote.charge_amount = policy.min_charge;
    }
    if charge < 0 {
        let refund = -charge;
        quote.refund_amount = if policy.min_refund > 0 && refund < policy.min_refund {
            0
        } else {
            refund
        };
    }
    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AdminStatus, InstanceStatus};
    use chrono::Duration;

    fn point(percent: f64, ratio: f64) -> RefundCurvePoint {
        RefundCurvePoint { percent, ratio }
    }

    fn plan() -> PlanGroup {
        let open = AddonRange { min: 0, max: 16, step: 1 };
        PlanGroup {
            id: 1,
            line_id: 7,
            add_core: open,
            add_mem: AddonRange { min: 2, max: 32, step: 2 },
            add_disk: AddonRange { min: -1, max: 0, step: 0 },
            add_bw: open,
            unit_core: 500,
            unit_mem: 200,
            unit_disk: 10,
            unit_bw: 100,
        }
    }

    fn package(id: Id, monthly: i64, cpu: i32) -> Package {
        Package {
            id,
            name: format!("pkg-{}", id),
            goods_type_id: 1,
            plan_group_id: 1,
            cpu,
            memory_gb: 2,
            disk_gb: 40,
            bandwidth_mbps: 10,
            port_num: 30,
            monthly_price: monthly,
            active: true,
        }
    }

    fn instance(created: DateTime<Utc>, expire: DateTime<Utc>) -> VpsInstance {
        VpsInstance {
            id: 1,
            user_id: 1,
            order_item_id: 1,
            automation_instance_id: "100".into(),
            goods_type_id: 1,
            name: "ecs".into(),
            package_id: 1,
            package_name: "pkg".into(),
            cpu: 1,
            memory_gb: 2,
            disk_gb: 40,
            bandwidth_mbps: 10,
            port_num: 30,
            monthly_price: 3000,
            spec: SpecDoc::new(),
            system_id: 1,
            status: InstanceStatus::Running,
            automation_state: 2,
            admin_status: AdminStatus::Normal,
            expire_at: Some(expire),
            panel_url_cache: None,
            access_info: Default::default(),
            last_emergency_renew_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn test_normalize_curve() {
        let curve = normalize_curve(vec![point(50.0, 0.5), point(-1.0, 1.0), point(0.0, 1.7), point(50.0, 0.4)]);
        assert_eq!(curve, vec![point(0.0, 1.0), point(50.0, 0.4)]);
    }

    #[test]
    fn test_curve_interpolates_and_holds_ends() {
        let curve = vec![point(10.0, 1.0), point(50.0, 0.5), point(80.0, 0.0)];
        assert_eq!(curve_ratio(&curve, 0.0), Some(1.0));
        assert_eq!(curve_ratio(&curve, 30.0), Some(0.75));
        assert_eq!(curve_ratio(&curve, 100.0), Some(0.0));
        assert_eq!(curve_ratio(&[], 30.0), None);
    }

    #[test]
    fn test_linear_curve_refunds() {
        let now = Utc::now();
        let policy = RefundPolicy {
            curve: Some(vec![point(0.0, 1.0), point(100.0, 0.0)]),
            ..RefundPolicy::default()
        };
        let fresh = instance(now, now + Duration::days(30));
        assert_eq!(refund_amount(&fresh, 3000, &policy, now), 3000);

        let half = instance(now - Duration::days(15), now + Duration::days(15));
        assert_eq!(refund_amount(&half, 3001, &policy, now), round_cents(3001.0 * 0.5));

        let mut ended = instance(now - Duration::days(30), now + Duration::seconds(1));
        ended.spec.set_current_period(now - Duration::days(30), now);
        assert_eq!(refund_amount(&ended, 3000, &policy, now), 0);
    }

    #[test]
    fn test_threshold_refunds() {
        let now = Utc::now();
        let policy = RefundPolicy::default();
        let fresh = instance(now - Duration::hours(2), now + Duration::days(30));
        assert_eq!(refund_amount(&fresh, 3000, &policy, now), 3000);

        let old = instance(now - Duration::days(29), now + Duration::days(1));
        assert_eq!(refund_amount(&old, 3000, &policy, now), 0);
        assert_eq!(refund_amount(&fresh, 0, &policy, now), 0);

        let expired = instance(now - Duration::days(31), now - Duration::days(1));
        assert_eq!(refund_amount(&expired, 3000, &policy, now), 0);
    }

    #[test]
    fn test_prorate_band_without_known_period() {
        let now = Utc::now();
        let mut inst = instance(now - Duration::days(3), now + Duration::days(30));
        inst.expire_at = None;
        let policy = RefundPolicy {
            full_days: 1,
            prorate_days: 6,
            no_refund_days: 30,
            ..RefundPolicy::default()
        };
        // age 72h inside the 144h prorate band: half back
        assert_eq!(refund_amount(&inst, 3000, &policy, now), 1500);
    }

    #[test]
    fn test_addon_validation() {
        let plan = plan();
        let ok = CartSpec { add_cores: 2, add_mem_gb: 4, ..Default::default() };
        assert!(validate_addons(&ok, &plan).is_ok());

        for bad in [
            CartSpec { add_mem_gb: 3, ..Default::default() },
            CartSpec { add_mem_gb: 34, ..Default::default() },
            CartSpec { add_disk_gb: 10, ..Default::default() },
            CartSpec { add_cores: -1, ..Default::default() },
        ] {
            assert!(matches!(validate_addons(&bad, &plan), Err(BrokerError::InvalidInput(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_item_price_with_cycle() {
        let plan = plan();
        let pkg = package(1, 1000, 1);
        let spec = CartSpec { add_cores: 1, cycle_qty: 2, ..Default::default() };
        let cycle = BillingCycle {
            id: 3,
            months: 3,
            multiplier_bp: 28_500,
            min_qty: 1,
            max_qty: 4,
            active: true,
        };
        let price = price_item(&pkg, &plan, Some(&cycle), &spec).unwrap();
        assert_eq!(price, ItemPrice { amount: 1500 * 57_000 / 10_000, months: 6 });

        let plain = price_item(&pkg, &plan, None, &CartSpec::default()).unwrap();
        assert_eq!(plain, ItemPrice { amount: 1000, months: 1 });

        let too_many = CartSpec { cycle_qty: 5, ..Default::default() };
        assert!(price_item(&pkg, &plan, Some(&cycle), &too_many).is_err());
    }

    #[test]
    fn test_prorate_rounding_modes() {
        assert_eq!(prorate(1000, 1, 3, Rounding::Nearest), 333);
        assert_eq!(prorate(1000, 1, 3, Rounding::Ceil), 334);
        assert_eq!(prorate(-1000, 1, 3, Rounding::Floor), -334);
        assert_eq!(prorate(-1000, 1, 3, Rounding::Ceil), -333);
        assert_eq!(prorate(1000, 2, 0, Rounding::Nearest), 0);
    }

    fn quote_for(policy: &ResizePolicy, target: &Package, spec: &CartSpec) -> BrokerResult<ResizeQuote> {
        let now = Utc::now();
        let mut inst = instance(now - Duration::days(15), now + Duration::days(15));
        inst.spec.set_current_period(now - Duration::days(15), now + Duration::days(15));
        let plan = plan();
        let current = package(1, 3000, 1);
        quote_resize(ResizeInputs {
            instance: &inst,
            current_package: &current,
            target_package: target,
            plan: &plan,
            current_spec: &CartSpec::default(),
            target_spec: spec,
            policy,
            now,
        })
    }

    #[test]
    fn test_resize_upgrade_is_prorated() {
        let policy = ResizePolicy::default();
        let quote = quote_for(&policy, &package(2, 5000, 2), &CartSpec::default()).unwrap();
        assert_eq!(quote.charge_amount, 1000);
        assert_eq!(quote.order_total(), 1000);
        assert_eq!(quote.target_package_id, 2);
        assert_eq!(quote.target_cpu, 2);

        let full = ResizePolicy { price_mode: ResizePriceMode::Full, ..ResizePolicy::default() };
        assert_eq!(quote_for(&full, &package(2, 5000, 2), &CartSpec::default()).unwrap().charge_amount, 2000);
    }

    #[test]
    fn test_resize_downgrade_respects_min_refund() {
        let policy = ResizePolicy::default();
        let quote = quote_for(&policy, &package(2, 1000, 2), &CartSpec::default()).unwrap();
        assert_eq!(quote.charge_amount, -1000);
        assert_eq!(quote.refund_amount, 1000);
        assert_eq!(quote.order_total(), 0);

        let strict = ResizePolicy { min_refund: 5000, ..ResizePolicy::default() };
        assert_eq!(quote_for(&strict, &package(2, 1000, 2), &CartSpec::default()).unwrap().refund_amount, 0);
    }

    #[test]
    fn test_resize_rejections() {
        let policy = ResizePolicy::default();
        assert_eq!(
            quote_for(&policy, &package(1, 3000, 1), &CartSpec::default()),
            Err(BrokerError::ResizeSamePlan)
        );
        let mut other_plan = package(2, 5000, 2);
        other_plan.plan_group_id = 9;
        assert!(matches!(
            quote_for(&policy, &other_plan, &CartSpec::default()),
            Err(BrokerError::InvalidInput(_))
        ));
        let mut smaller_disk = package(2, 5000, 2);
        smaller_disk.disk_gb = 20;
        assert!(matches!(
            quote_for(&policy, &smaller_disk, &CartSpec::default()),
            Err(BrokerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_resize_spec_payload() {
        let quote = quote_for(&ResizePolicy::default(), &package(2, 5000, 2), &CartSpec::default()).unwrap();
        let spec = quote.to_spec(7, &CartSpec::default());
        assert_eq!(spec.vps_id(), Some(7));
        assert_eq!(spec.get_i64("charge_amount"), Some(1000));
        assert_eq!(spec.get_bool("refund_to_wallet"), Some(true));
    }
}
