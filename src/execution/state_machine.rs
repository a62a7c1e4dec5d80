// =============================================================================
// Order lifecycle state machine — pure event → (status, filled, terminal)
// =============================================================================
//
// Both REST order reads and myOrder WebSocket events funnel through
// `transition`. Filled volume is monotonic non-decreasing for the life of an
// order, and a terminal result latches: callers must not apply further events
// once `terminal` is returned.
// =============================================================================

use crate::types::OrderStatus;

/// Volume tolerance when comparing filled against ordered volume.
pub const FILL_EPSILON: f64 = 1e-8;

/// Result of applying one exchange event to an order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub status: OrderStatus,
    pub filled_volume: f64,
    pub terminal: bool,
}

/// Map an exchange order event to the order's next state.
///
/// * `event`           — exchange state string, matched case-insensitively.
/// * `current_filled`  — filled volume known before this event.
/// * `order_volume`    — total ordered volume.
/// * `executed`        — executed volume reported by the event (0 if absent).
/// * `remaining`       — remaining volume reported by the event (0 if absent).
pub fn transition(
    event: &str,
    current_filled: f64,
    order_volume: f64,
    executed: f64,
    remaining: f64,
) -> Transition {
    // Fold every volume hint into a monotonic fill estimate.
    let mut filled = current_filled;
    if executed > 0.0 {
        filled = filled.max(executed);
    }
    if remaining > 0.0 && order_volume > remaining {
        filled = filled.max(order_volume - remaining);
    }

    let event = event.to_ascii_lowercase();

    match event.as_str() {
        "filled" | "done" => Transition {
            status: OrderStatus::Filled,
            filled_volume: if filled > 0.0 { filled } else { order_volume },
            terminal: true,
        },
        "cancel" | "cancelled" => Transition {
            status: OrderStatus::Cancelled,
            filled_volume: filled,
            terminal: true,
        },
        "rejected" | "reject" | "prevented" => Transition {
            status: OrderStatus::Rejected,
            filled_volume: filled,
            terminal: true,
        },
        "partially_filled" | "partial_fill" | "wait" | "watch" | "trade" => {
            if filled >= order_volume - FILL_EPSILON {
                Transition {
                    status: OrderStatus::Filled,
                    filled_volume: filled,
                    terminal: true,
                }
            } else if filled > 0.0 {
                Transition {
                    status: OrderStatus::PartiallyFilled,
                    filled_volume: filled,
                    terminal: false,
                }
            } else {
                Transition {
                    status: OrderStatus::Submitted,
                    filled_volume: filled,
                    terminal: false,
                }
            }
        }
        // "submitted" / "pending" / "new", and anything unknown, resolve
        // conservatively from the fill estimate alone.
        _ => Transition {
            status: if filled > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Submitted
            },
            filled_volume: filled,
            terminal: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_event_keeps_zero_fill() {
        let r = transition("submitted", 0.0, 1.0, 0.0, 1.0);
        assert_eq!(r.status, OrderStatus::Submitted);
        assert!(!r.terminal);
        assert_eq!(r.filled_volume, 0.0);
    }

    #[test]
    fn trade_event_computes_partial_fill() {
        let r = transition("trade", 0.0, 2.0, 0.5, 1.5);
        assert_eq!(r.status, OrderStatus::PartiallyFilled);
        assert!(!r.terminal);
        assert!((r.filled_volume - 0.5).abs() < 1e-9);
    }

    #[test]
    fn done_fills_to_full_volume_for_any_prior_fill() {
        for prior in [0.0, 0.3, 1.0] {
            let r = transition("done", prior, 1.0, 1.0, 0.0);
            assert_eq!(r.status, OrderStatus::Filled);
            assert!(r.terminal);
            assert!((r.filled_volume - 1.0).abs() < 1e-9);
        }
        // No volume hints at all: fall back to the ordered volume.
        let r = transition("done", 0.0, 1.0, 0.0, 0.0);
        assert_eq!(r.filled_volume, 1.0);
    }

    #[test]
    fn cancel_preserves_partial_fill() {
        let r = transition("cancelled", 0.2, 1.0, 0.2, 0.8);
        assert_eq!(r.status, OrderStatus::Cancelled);
        assert!(r.terminal);
        assert!((r.filled_volume - 0.2).abs() < 1e-9);
    }

    #[test]
    fn reject_variants_are_terminal() {
        for ev in ["rejected", "reject", "prevented", "PREVENTED"] {
            let r = transition(ev, 0.0, 1.0, 0.0, 1.0);
            assert_eq!(r.status, OrderStatus::Rejected);
            assert!(r.terminal);
        }
    }

    #[test]
    fn wait_with_full_fill_promotes_to_filled() {
        let r = transition("wait", 0.0, 1.0, 1.0, 0.0);
        assert_eq!(r.status, OrderStatus::Filled);
        assert!(r.terminal);
    }

    #[test]
    fn fill_volume_is_monotonic() {
        // A later event with a smaller executed volume never shrinks the fill.
        let first = transition("trade", 0.0, 2.0, 0.8, 1.2);
        let second = transition("trade", first.filled_volume, 2.0, 0.5, 1.5);
        assert!(second.filled_volume >= first.filled_volume);
    }

    #[test]
    fn unknown_event_is_conservative() {
        let r = transition("mystery", 0.0, 1.0, 0.0, 0.0);
        assert_eq!(r.status, OrderStatus::Submitted);
        assert!(!r.terminal);

        let r = transition("mystery", 0.4, 1.0, 0.0, 0.0);
        assert_eq!(r.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn case_insensitive_events() {
        assert_eq!(transition("Done", 0.0, 1.0, 0.0, 0.0).status, OrderStatus::Filled);
        assert_eq!(
            transition("CANCEL", 0.0, 1.0, 0.0, 0.0).status,
            OrderStatus::Cancelled
        );
    }
}
