//! Display formatting for measured speeds.
//!
//! Pure conversions from raw bits-per-second values to human-scaled
//! strings. Nothing here caches: inputs change every tick, so callers
//! format fresh on every render.

/// Format a raw bits-per-second value with an auto-selected unit.
///
/// With `round` the numeric part is rounded to a whole number, otherwise
/// it is printed with exactly two decimal places.
///
/// Tbps only kicks in at 1e14 bps; values in `[1e12, 1e14)` have no unit
/// band and render as the literal `"0bps"`. Output in that band is locked
/// by tests, so think twice before "fixing" the thresholds.
pub fn format_bits_per_second(bps: f64, round: bool) -> String {
    if bps == 0.0 {
        return "0 Kbps".to_string();
    }

    if bps < 1_000_000.0 {
        return scaled(bps / 1_000.0, "Kbps", round);
    }

    if bps < 1_000_000_000.0 {
        return scaled(bps / 1_000_000.0, "Mbps", round);
    }

    if bps < 1_000_000_000_000.0 {
        return scaled(bps / 1_000_000_000.0, "Gbps", round);
    }

    if bps >= 100_000_000_000_000.0 {
        return scaled(bps / 1_000_000_000_000.0, "Tbps", round);
    }

    "0bps".to_string()
}

fn scaled(value: f64, unit: &str, round: bool) -> String {
    if round {
        format!("{} {}", value.round() as i64, unit)
    } else {
        format!("{:.2} {}", value, unit)
    }
}

/// The large central speed readout: numeric part and unit, separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headline {
    /// Numeric part, already formatted. Empty when there is nothing to show.
    pub value: String,
    /// Unit label accompanying the value.
    pub unit: &'static str,
}

/// Format the headline readout from a speed already expressed in Mbps.
///
/// Above 1000 Mbps the value switches to Gbps with no forced precision;
/// between 10 and 1000 it is shown as whole Mbps; between 1 and 10 with
/// two decimals; at or below 1 Mbps as whole Kbps. Zero renders nothing.
pub fn format_headline(mbps: f64) -> Headline {
    if mbps == 0.0 {
        return Headline { value: String::new(), unit: "" };
    }

    if mbps > 1000.0 {
        return Headline { value: format!("{}", mbps / 1000.0), unit: "Gbps" };
    }

    if mbps > 10.0 {
        return Headline {
            value: format!("{}", mbps.round() as i64),
            unit: "Mbps",
        };
    }

    if mbps > 1.0 {
        return Headline { value: format!("{:.2}", mbps), unit: "Mbps" };
    }

    Headline {
        value: format!("{}", (mbps * 1000.0).round() as i64),
        unit: "Kbps",
    }
}
