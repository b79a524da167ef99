/// An order earns points only once money moved: an advance was paid or the
/// order went to production.
pub fn order_qualifies(advance_cents: i64, sent_to_production: bool) -> bool {
    advance_cents > 0 || sent_to_production
}

/// `floor(total / threshold) * points_per_threshold`.
///
/// A non-positive threshold or total earns nothing.
pub fn purchase_amount_points(total_cents: i64, threshold_cents: i64, points_per_threshold: i64) -> i64 {
    if threshold_cents <= 0 || total_cents <= 0 || points_per_threshold <= 0 {
        return 0;
    }
    (total_cents / threshold_cents) * points_per_threshold
}

/// How many milestones the client crossed that have not been rewarded yet.
///
/// # Arguments
/// * `qualifying_orders` - Qualifying orders in scope, including the current one
/// * `purchases_required` - Orders per milestone
/// * `already_rewarded` - Milestone rewards already present in the history
pub fn new_milestones(qualifying_orders: i64, purchases_required: i64, already_rewarded: i64) -> i64 {
    if purchases_required <= 0 {
        return 0;
    }
    let reached = qualifying_orders / purchases_required;
    (reached - already_rewarded).max(0)
}

/// The current order is the first qualifying one in scope.
pub fn is_first_purchase(qualifying_orders: i64) -> bool {
    qualifying_orders <= 1
}
