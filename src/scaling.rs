use crate::types::OverrideType;

/// Composes the override percentage with the global one. `additive` shifts
/// the global percentage by the override's delta from 100, floored at 0.
pub fn compose_percentage(global: i32, override_percentage: i32, override_type: OverrideType) -> i32 {
    match override_type {
        OverrideType::Override => override_percentage,
        OverrideType::Additive => global
            .saturating_add(override_percentage)
            .saturating_sub(100)
            .max(0),
    }
}

/// Target size for an original size under a percentage and bounds. Rounds
/// half away from zero, saturates at i32 on extreme products, and clamps to
/// `max(1, min) ..= max`, the max bound winning.
pub fn target_replicas(original: i32, percentage: i32, min: i32, max: i32) -> i32 {
    let raw = (original as f64 * percentage as f64 / 100.0).round();
    let mut target = raw as i32;
    if target < 1 {
        target = 1;
    }
    if target < min {
        target = min;
    }
    if target > max {
        target = max;
    }
    target
}

/// New HPA limits: the sizing rule applied to the original min and max
/// independently, then min forced to at least 1 and max to at least min.
pub fn hpa_limits(
    original_min: i32,
    original_max: i32,
    percentage: i32,
    min: i32,
    max: i32,
) -> (i32, i32) {
    let new_min = target_replicas(original_min, percentage, min, max).max(1);
    let new_max = target_replicas(original_max, percentage, min, max).max(new_min);
    (new_min, new_max)
}
