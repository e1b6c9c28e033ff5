//! Slider codecs: map human values onto bounded, possibly non-linear, slider travel.
//!
//! A codec owns three things: the value <-> position mapping, the precision the value is
//! rounded to, and the label shown for a value. `resolve_range` turns a pair of slider
//! positions into the filter value that goes on the wire.

use tally_core::expr::OPEN_ENDED_MAX_SENTINEL;
use tally_core::{Catalog, FilterValue};

pub trait RangeCodec: Send + Sync {
    fn slider_bounds(&self) -> (f64, f64);
    fn value_bounds(&self) -> (f64, f64);
    fn step(&self) -> f64;
    fn to_position(&self, value: f64) -> f64;
    fn from_position(&self, position: f64) -> f64;
    /// Round to the codec's declared precision.
    fn post_process(&self, value: f64) -> f64;
    fn label(&self, value: f64) -> String;
    fn open_ended_sentinel(&self) -> f64 { OPEN_ENDED_MAX_SENTINEL }
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 { v.max(lo).min(hi) }

pub fn round_to(v: f64, decimals: i32) -> f64 {
    let m = 10f64.powi(decimals);
    (v * m).round() / m
}

// ---------------- GPU hourly price (linear) ----------------

pub const GPU_PRICE_MIN: f64 = 0.01;
pub const GPU_PRICE_MAX: f64 = 20.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearPrice;

impl RangeCodec for LinearPrice {
    fn slider_bounds(&self) -> (f64, f64) { (GPU_PRICE_MIN, GPU_PRICE_MAX) }
    fn value_bounds(&self) -> (f64, f64) { (GPU_PRICE_MIN, GPU_PRICE_MAX) }
    fn step(&self) -> f64 { 0.01 }
    fn to_position(&self, value: f64) -> f64 { clamp(value, GPU_PRICE_MIN, GPU_PRICE_MAX) }
    fn from_position(&self, position: f64) -> f64 { clamp(position, GPU_PRICE_MIN, GPU_PRICE_MAX) }
    fn post_process(&self, value: f64) -> f64 { round_to(value, 2) }
    fn label(&self, value: f64) -> String {
        if value >= GPU_PRICE_MAX { format!("${:.0}+", GPU_PRICE_MAX) }
        else if value.fract() != 0.0 { format!("${:.2}", value) }
        else { format!("${:.0}", value) }
    }
}

// ---------------- Price per token (hybrid linear / power) ----------------

pub const PRICE_VALUE_MAX: f64 = 10.0;
const PRICE_KNEE_POSITION: f64 = 0.5;
const PRICE_KNEE_VALUE: f64 = 1.0;

/// Exponent chosen so that position 0.75 lands at $5/M: `ln(4/9) / ln(0.5)`.
pub fn price_exponent() -> f64 { (4.0f64 / 9.0).ln() / 0.5f64.ln() }

/// Values are USD per million tokens. The lower half of travel covers $0-$1 linearly,
/// the upper half reaches $10 along a power curve.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricePerToken;

impl PricePerToken {
    pub fn per_token_to_position(&self, per_token: f64) -> f64 { self.to_position(per_token * 1_000_000.0) }
    pub fn position_to_per_token(&self, position: f64) -> f64 { self.from_position(position) / 1_000_000.0 }
}

impl RangeCodec for PricePerToken {
    fn slider_bounds(&self) -> (f64, f64) { (0.0, 1.0) }
    fn value_bounds(&self) -> (f64, f64) { (0.0, PRICE_VALUE_MAX) }
    fn step(&self) -> f64 { 0.001 }

    fn to_position(&self, value: f64) -> f64 {
        let per_million = clamp(value, 0.0, PRICE_VALUE_MAX);
        if per_million <= PRICE_KNEE_VALUE {
            return per_million / PRICE_KNEE_VALUE * PRICE_KNEE_POSITION;
        }
        let ratio = clamp((per_million - PRICE_KNEE_VALUE) / (PRICE_VALUE_MAX - PRICE_KNEE_VALUE), 0.0, 1.0);
        PRICE_KNEE_POSITION + ratio.powf(1.0 / price_exponent()) * (1.0 - PRICE_KNEE_POSITION)
    }

    fn from_position(&self, position: f64) -> f64 {
        let p = clamp(position, 0.0, 1.0);
        if p <= PRICE_KNEE_POSITION {
            return p / PRICE_KNEE_POSITION * PRICE_KNEE_VALUE;
        }
        let ratio = clamp((p - PRICE_KNEE_POSITION) / (1.0 - PRICE_KNEE_POSITION), 0.0, 1.0);
        PRICE_KNEE_VALUE + ratio.powf(price_exponent()) * (PRICE_VALUE_MAX - PRICE_KNEE_VALUE)
    }

    fn post_process(&self, value: f64) -> f64 { round_to(value, 2) }

    fn label(&self, value: f64) -> String {
        if value >= PRICE_VALUE_MAX { format!("${:.0}+/M", PRICE_VALUE_MAX) } else { format!("${:.2}/M", value) }
    }
}

// ---------------- VRAM capacity (discrete stops) ----------------

pub const VRAM_STOPS: [f64; 7] = [16.0, 32.0, 48.0, 64.0, 80.0, 96.0, 192.0];

/// Slider travel `[0, stops-1]`; whole positions land on stops, fractions interpolate.
#[derive(Debug, Clone)]
pub struct DiscreteStops {
    stops: Vec<f64>,
    unit: &'static str,
}

impl DiscreteStops {
    pub fn new(stops: &[f64], unit: &'static str) -> Self { Self { stops: stops.to_vec(), unit } }
    pub fn vram() -> Self { Self::new(&VRAM_STOPS, "GB") }
    fn last(&self) -> usize { self.stops.len().saturating_sub(1) }
}

impl RangeCodec for DiscreteStops {
    fn slider_bounds(&self) -> (f64, f64) { (0.0, self.last() as f64) }
    fn value_bounds(&self) -> (f64, f64) {
        (self.stops.first().copied().unwrap_or(0.0), self.stops.last().copied().unwrap_or(0.0))
    }
    fn step(&self) -> f64 { 0.001 }

    fn to_position(&self, value: f64) -> f64 {
        let (lo, hi) = self.value_bounds();
        let v = clamp(value, lo, hi);
        for (i, pair) in self.stops.windows(2).enumerate() {
            if v >= pair[0] && v <= pair[1] {
                let span = pair[1] - pair[0];
                let fraction = if span == 0.0 { 0.0 } else { (v - pair[0]) / span };
                return i as f64 + fraction;
            }
        }
        self.last() as f64
    }

    fn from_position(&self, position: f64) -> f64 {
        if self.stops.is_empty() { return 0.0; }
        let p = clamp(position, 0.0, self.last() as f64);
        let lower = p.floor() as usize;
        let upper = (p.ceil() as usize).min(self.last());
        if lower == upper { return self.stops[lower]; }
        let fraction = p - lower as f64;
        self.stops[lower] + (self.stops[upper] - self.stops[lower]) * fraction
    }

    fn post_process(&self, value: f64) -> f64 { value.round() }

    fn label(&self, value: f64) -> String {
        let n = value.round();
        if n >= self.value_bounds().1 { format!("{}{}+", n, self.unit) } else { format!("{}{}", n, self.unit) }
    }
}

// ---------------- Context length (anchored piecewise-linear) ----------------

pub const CONTEXT_MAX: f64 = 1_000_000.0;
pub const CONTEXT_ANCHORS: [(f64, f64); 5] = [(0.0, 0.0), (0.03, 1_000.0), (0.5, 500_000.0), (0.97, CONTEXT_MAX), (1.0, CONTEXT_MAX)];

#[derive(Debug, Clone, Copy, Default)]
pub struct Anchored;

impl RangeCodec for Anchored {
    fn slider_bounds(&self) -> (f64, f64) { (0.0, 1.0) }
    fn value_bounds(&self) -> (f64, f64) { (0.0, CONTEXT_MAX) }
    fn step(&self) -> f64 { 0.001 }

    fn to_position(&self, value: f64) -> f64 {
        let v = clamp(value, 0.0, CONTEXT_MAX);
        for pair in CONTEXT_ANCHORS.windows(2) {
            let ((s0, v0), (s1, v1)) = (pair[0], pair[1]);
            if v >= v0 && v <= v1 {
                let span = if v1 - v0 == 0.0 { 1.0 } else { v1 - v0 };
                return s0 + (v - v0) / span * (s1 - s0);
            }
        }
        1.0
    }

    fn from_position(&self, position: f64) -> f64 {
        let p = clamp(position, 0.0, 1.0);
        for pair in CONTEXT_ANCHORS.windows(2) {
            let ((s0, v0), (s1, v1)) = (pair[0], pair[1]);
            if p >= s0 && p <= s1 {
                let span = if s1 - s0 == 0.0 { 1.0 } else { s1 - s0 };
                return v0 + (p - s0) / span * (v1 - v0);
            }
        }
        CONTEXT_MAX
    }

    fn post_process(&self, value: f64) -> f64 { value.round() }

    fn label(&self, value: f64) -> String {
        if value >= CONTEXT_MAX { "1M+".to_string() }
        else if value >= 1_000.0 { format!("{}K", (value / 1_000.0).round()) }
        else { format!("{}", value.round()) }
    }
}

/// Codec for a catalog's slider field, if it has one.
pub fn codec_for(catalog: Catalog, field: &str) -> Option<Box<dyn RangeCodec>> {
    match (catalog, field) {
        (Catalog::Gpu | Catalog::Cpu, "price_hour_usd") => Some(Box::new(LinearPrice)),
        (Catalog::Gpu, "vram_gb") => Some(Box::new(DiscreteStops::vram())),
        (Catalog::Model, "contextLength") => Some(Box::new(Anchored)),
        (Catalog::Model, "inputPrice" | "outputPrice") => Some(Box::new(PricePerToken)),
        _ => None,
    }
}

/// Turn two slider positions into a range filter.
///
/// Full travel means no filter. A max handle at the upper bound yields the open-ended
/// sentinel instead of the nominal max.
pub fn resolve_range(codec: &dyn RangeCodec, a: f64, b: f64) -> Option<FilterValue> {
    let (smin, smax) = codec.slider_bounds();
    let (a, b) = (clamp(a, smin, smax), clamp(b, smin, smax));
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let tolerance = codec.step().max(1e-12);
    let at_max = hi >= smax - tolerance;
    if lo <= smin + tolerance && at_max {
        return None;
    }
    let (vmin, vmax) = codec.value_bounds();
    let min = clamp(codec.post_process(codec.from_position(lo)), vmin, vmax);
    let max = if at_max { codec.open_ended_sentinel() } else { clamp(codec.post_process(codec.from_position(hi)), vmin, vmax) };
    Some(FilterValue::range(min, max))
}

/// Slider positions for an existing filter; the sentinel maps to the upper bound.
pub fn positions_of(codec: &dyn RangeCodec, value: Option<&FilterValue>) -> (f64, f64) {
    let (smin, smax) = codec.slider_bounds();
    match value {
        Some(FilterValue::Range(min, max)) => {
            let lo = clamp(codec.to_position(*min), smin, smax);
            let hi = if *max >= codec.open_ended_sentinel() { smax } else { clamp(codec.to_position(*max), smin, smax) };
            if lo <= hi { (lo, hi) } else { (hi, lo) }
        }
        _ => (smin, smax),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(c: &dyn RangeCodec, v: f64) -> f64 { c.post_process(c.from_position(c.to_position(v))) }

    #[test]
    fn price_per_token_midpoint_is_one_dollar_per_million() {
        let c = PricePerToken;
        assert_eq!(c.from_position(0.5), 1.0);
        assert_eq!(c.position_to_per_token(0.5) * 1_000_000.0, 1.0);
        assert_eq!(c.to_position(1.0), 0.5);
        assert_eq!(c.from_position(0.0), 0.0);
        assert!((c.from_position(1.0) - 10.0).abs() < 1e-9);
        assert!((c.from_position(0.75) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn price_per_token_full_max_is_open_ended() {
        let c = PricePerToken;
        assert_eq!(resolve_range(&c, 0.5, 1.0), Some(FilterValue::Range(1.0, OPEN_ENDED_MAX_SENTINEL)));
        assert_eq!(resolve_range(&c, 0.0, 1.0), None);
        assert_eq!(resolve_range(&c, 0.0, 0.25), Some(FilterValue::Range(0.0, 0.5)));
    }

    #[test]
    fn codecs_roundtrip_within_precision() {
        let price = PricePerToken;
        for cents in 0..=1000 {
            let v = cents as f64 / 100.0;
            assert_eq!(roundtrip(&price, v), v, "price {}", v);
        }
        let vram = DiscreteStops::vram();
        for v in 16..=192 {
            assert_eq!(roundtrip(&vram, v as f64), v as f64, "vram {}", v);
        }
        let ctx = Anchored;
        for v in [0.0, 500.0, 1_000.0, 8_192.0, 128_000.0, 500_000.0, 999_999.0, 1_000_000.0] {
            assert_eq!(roundtrip(&ctx, v), v, "context {}", v);
        }
        let gpu = LinearPrice;
        for v in [0.01, 1.5, 2.49, 19.99, 20.0] {
            assert_eq!(roundtrip(&gpu, v), v);
        }
    }

    #[test]
    fn discrete_stops_clamp_instead_of_extrapolating() {
        let vram = DiscreteStops::vram();
        assert_eq!(vram.from_position(-3.0), 16.0);
        assert_eq!(vram.from_position(42.0), 192.0);
        assert_eq!(vram.from_position(4.0), 80.0);
        assert_eq!(vram.from_position(5.5), 144.0);
        assert_eq!(vram.to_position(8.0), 0.0);
        assert_eq!(vram.to_position(500.0), 6.0);
    }

    #[test]
    fn upper_bound_emits_sentinel_and_positions_invert() {
        let vram = DiscreteStops::vram();
        let f = resolve_range(&vram, 4.0, 6.0).unwrap();
        assert_eq!(f, FilterValue::Range(80.0, OPEN_ENDED_MAX_SENTINEL));
        assert_eq!(positions_of(&vram, Some(&f)), (4.0, 6.0));
        assert_eq!(positions_of(&vram, None), (0.0, 6.0));
        assert_eq!(vram.label(192.0), "192GB+");
        assert_eq!(Anchored.label(128_000.0), "128K");
        assert_eq!(LinearPrice.label(20.0), "$20+");
    }
}
