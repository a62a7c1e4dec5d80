// =============================================================================
// KRW tick-size ladder
// =============================================================================
//
// Local fallback for the exchange's price-unit rules, used when the
// instruments endpoint is unavailable. Prices on a KRW market must be an
// integer multiple of the tick for their price band.
// =============================================================================

/// Tick size for a KRW price level.
pub fn tick_size_for(price: f64) -> f64 {
    if price >= 2_000_000.0 {
        1_000.0
    } else if price >= 1_000_000.0 {
        500.0
    } else if price >= 500_000.0 {
        100.0
    } else if price >= 100_000.0 {
        50.0
    } else if price >= 10_000.0 {
        10.0
    } else if price >= 1_000.0 {
        1.0
    } else if price >= 100.0 {
        0.1
    } else if price >= 10.0 {
        0.01
    } else if price >= 1.0 {
        0.001
    } else if price >= 0.1 {
        0.0001
    } else {
        0.000_01
    }
}

/// Round `price` down to the nearest valid tick for its band.
pub fn round_down_to_tick(price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let tick = tick_size_for(price);
    (price / tick).floor() * tick
}

/// Whether `price` sits on an integer multiple of `tick_size`, within a
/// relative tolerance that absorbs f64 division noise.
pub fn is_aligned(price: f64, tick_size: f64) -> bool {
    if price <= 0.0 || tick_size <= 0.0 {
        return false;
    }
    let normalized = price / tick_size;
    let nearest = normalized.round();
    let tolerance = f64::max(1e-8, normalized.abs() * 1e-10);
    (normalized - nearest).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_bands() {
        assert_eq!(tick_size_for(3_500_000.0), 1_000.0);
        assert_eq!(tick_size_for(1_500_000.0), 500.0);
        assert_eq!(tick_size_for(700_000.0), 100.0);
        assert_eq!(tick_size_for(150_000.0), 50.0);
        assert_eq!(tick_size_for(50_000.0), 10.0);
        assert_eq!(tick_size_for(5_000.0), 1.0);
        assert_eq!(tick_size_for(500.0), 0.1);
        assert_eq!(tick_size_for(50.0), 0.01);
        assert_eq!(tick_size_for(5.0), 0.001);
        assert_eq!(tick_size_for(0.5), 0.0001);
        assert_eq!(tick_size_for(0.05), 0.000_01);
    }

    #[test]
    fn round_down_stays_on_grid() {
        assert_eq!(round_down_to_tick(100_001.0), 100_000.0);
        assert_eq!(round_down_to_tick(99_997.0), 99_990.0);
        assert_eq!(round_down_to_tick(2_000_700.0), 2_000_000.0);
        assert_eq!(round_down_to_tick(0.0), 0.0);
    }

    #[test]
    fn alignment_exact_boundary() {
        // Exactly k × tick accepts.
        assert!(is_aligned(100_000.0, 100.0));
        assert!(is_aligned(100_100.0, 100.0));
        // One KRW off a 100-tick grid rejects.
        assert!(!is_aligned(100_001.0, 100.0));
        // Sub-tolerance float noise still accepts.
        assert!(is_aligned(100.0 * 3.0 + 1e-9, 100.0));
    }

    #[test]
    fn alignment_rejects_degenerate_inputs() {
        assert!(!is_aligned(0.0, 100.0));
        assert!(!is_aligned(100.0, 0.0));
        assert!(!is_aligned(-5.0, 1.0));
    }
}
