use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::PageSize;
use crate::error::ConfigError;
use crate::geometry::ViewportSize;

/// Horizontal allowance kept free around a single page fitted to width.
const WIDTH_FIT_MARGIN: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutofitClass {
    Auto,
    Height,
    Width,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReductionFactor {
    #[serde(rename = "reduce")]
    pub ratio: f32,
    #[serde(default)]
    pub autofit: Option<AutofitClass>,
}

impl ReductionFactor {
    pub fn new(ratio: f32) -> Self {
        Self {
            ratio,
            autofit: None,
        }
    }

    pub fn autofit(ratio: f32, class: AutofitClass) -> Self {
        Self {
            ratio,
            autofit: Some(class),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoomDirection {
    In,
    Out,
    Auto,
    Height,
    Width,
}

impl From<AutofitClass> for ZoomDirection {
    fn from(class: AutofitClass) -> Self {
        match class {
            AutofitClass::Auto => ZoomDirection::Auto,
            AutofitClass::Height => ZoomDirection::Height,
            AutofitClass::Width => ZoomDirection::Width,
        }
    }
}

impl fmt::Display for ZoomDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ZoomDirection::In => "in",
            ZoomDirection::Out => "out",
            ZoomDirection::Auto => "auto",
            ZoomDirection::Height => "height",
            ZoomDirection::Width => "width",
        };
        f.write_str(name)
    }
}

impl FromStr for ZoomDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(ZoomDirection::In),
            "out" => Ok(ZoomDirection::Out),
            "auto" => Ok(ZoomDirection::Auto),
            "height" => Ok(ZoomDirection::Height),
            "width" => Ok(ZoomDirection::Width),
            other => Err(format!("unknown zoom direction `{other}`")),
        }
    }
}

/// Factor whose ratio is closest to `requested`. Iteration is ascending and
/// only a strictly smaller distance replaces the best candidate, so the
/// smaller ratio wins a tie.
pub fn quantize(requested: f32, factors: &[ReductionFactor]) -> Option<ReductionFactor> {
    let mut best: Option<(f32, ReductionFactor)> = None;
    for factor in factors {
        let distance = (factor.ratio - requested).abs();
        match best {
            Some((best_distance, _)) if distance >= best_distance => {}
            _ => best = Some((distance, *factor)),
        }
    }
    best.map(|(_, factor)| factor)
}

/// Next factor for a zoom request. Falls back to the first factor (or the
/// last one when zooming out) when nothing qualifies.
pub fn next(
    current: f32,
    direction: ZoomDirection,
    factors: &[ReductionFactor],
) -> Option<ReductionFactor> {
    let first = factors.first().copied()?;
    let picked = match direction {
        ZoomDirection::In => factors
            .iter()
            .filter(|f| f.ratio < current)
            .max_by(|a, b| a.ratio.total_cmp(&b.ratio))
            .copied()
            .unwrap_or(first),
        ZoomDirection::Out => factors
            .iter()
            .filter(|f| f.ratio > current)
            .min_by(|a, b| a.ratio.total_cmp(&b.ratio))
            .copied()
            .or_else(|| factors.last().copied())
            .unwrap_or(first),
        ZoomDirection::Auto => factors
            .iter()
            .find(|f| f.autofit == Some(AutofitClass::Auto))
            .copied()
            .or_else(|| {
                factors
                    .iter()
                    .filter(|f| {
                        matches!(
                            f.autofit,
                            Some(AutofitClass::Height) | Some(AutofitClass::Width)
                        )
                    })
                    .max_by(|a, b| a.ratio.total_cmp(&b.ratio))
                    .copied()
            })
            .unwrap_or(first),
        ZoomDirection::Height => find_class(factors, AutofitClass::Height).unwrap_or(first),
        ZoomDirection::Width => find_class(factors, AutofitClass::Width).unwrap_or(first),
    };
    Some(picked)
}

fn find_class(factors: &[ReductionFactor], class: AutofitClass) -> Option<ReductionFactor> {
    factors.iter().find(|f| f.autofit == Some(class)).copied()
}

/// A validated, ascending, non-empty factor list.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionTable {
    factors: Vec<ReductionFactor>,
}

impl ReductionTable {
    pub fn new(factors: Vec<ReductionFactor>) -> Result<Self, ConfigError> {
        if factors.is_empty() {
            return Err(ConfigError::EmptyReductionTable);
        }
        let mut autos = 0;
        for (position, factor) in factors.iter().enumerate() {
            if !factor.ratio.is_finite() || factor.ratio <= 0.0 {
                return Err(ConfigError::InvalidRatio(factor.ratio));
            }
            if factor.autofit == Some(AutofitClass::Auto) {
                autos += 1;
            }
            if position > 0 && factors[position - 1].ratio > factor.ratio {
                return Err(ConfigError::Unsorted {
                    previous: factors[position - 1].ratio,
                    next: factor.ratio,
                });
            }
        }
        if autos > 1 {
            return Err(ConfigError::DuplicateAuto);
        }
        Ok(Self { factors })
    }

    pub fn from_ratios(ratios: &[f32]) -> Result<Self, ConfigError> {
        Self::new(ratios.iter().copied().map(ReductionFactor::new).collect())
    }

    /// Copy of this table with computed autofit entries merged in. Extras
    /// that are not usable ratios, or whose class is already present, are
    /// skipped so the result keeps every table invariant.
    pub fn with_extras(&self, extras: impl IntoIterator<Item = ReductionFactor>) -> Self {
        let mut factors = self.factors.clone();
        for extra in extras {
            if !extra.ratio.is_finite() || extra.ratio <= 0.0 {
                continue;
            }
            if extra.autofit.is_some() && factors.iter().any(|f| f.autofit == extra.autofit) {
                continue;
            }
            factors.push(extra);
        }
        factors.sort_by(|a, b| a.ratio.total_cmp(&b.ratio));
        Self { factors }
    }

    pub fn factors(&self) -> &[ReductionFactor] {
        &self.factors
    }

    fn first(&self) -> ReductionFactor {
        self.factors[0]
    }

    pub fn quantize(&self, requested: f32) -> ReductionFactor {
        quantize(requested, &self.factors).unwrap_or_else(|| self.first())
    }

    pub fn next(&self, current: f32, direction: ZoomDirection) -> ReductionFactor {
        next(current, direction, &self.factors).unwrap_or_else(|| self.first())
    }

    /// Ratio for a remembered autofit class, or the quantized scale.
    pub fn resolve(&self, scale: f32, autofit: Option<AutofitClass>) -> ReductionFactor {
        match autofit {
            Some(class) => self.next(scale, class.into()),
            None => self.quantize(scale),
        }
    }
}

/// Single page table: the base ratios plus fit-to-height and fit-to-width
/// entries for the document's median page.
pub fn single_page_table(
    base: &ReductionTable,
    median: PageSize,
    viewport: ViewportSize,
    padding: f32,
) -> ReductionTable {
    let usable_height = (viewport.height - 2.0 * padding).max(1.0);
    let usable_width = (viewport.width - WIDTH_FIT_MARGIN).max(1.0);
    base.with_extras([
        ReductionFactor::autofit(median.height / usable_height, AutofitClass::Height),
        ReductionFactor::autofit(median.width / usable_width, AutofitClass::Width),
    ])
}

/// Two page table: the base ratios plus the ratio that fits the spread.
pub fn spread_table(base: &ReductionTable, fit_ratio: f32) -> ReductionTable {
    base.with_extras([ReductionFactor::autofit(fit_ratio, AutofitClass::Auto)])
}

/// Reduction used to load a thumbnail cell: the width ratio rounded to an
/// even number, never below 1.
pub fn thumbnail_reduction(page_width: u32, thumb_width: f32) -> f32 {
    if thumb_width <= 0.0 {
        return 1.0;
    }
    let ratio = (page_width as f32 / thumb_width).floor();
    let even = 2.0 * (ratio / 2.0).round();
    even.max(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponsiveCandidate {
    pub reduction: f32,
    pub density: u32,
}

/// Power-of-two reductions finer than `ratio`, each tagged with the pixel
/// density it serves.
pub fn responsive_scales(ratio: f32) -> Vec<ResponsiveCandidate> {
    let scales: &[f32] = if ratio < 2.0 {
        &[]
    } else if ratio < 4.0 {
        &[1.0]
    } else if ratio < 8.0 {
        &[2.0, 1.0]
    } else if ratio < 16.0 {
        &[4.0, 2.0, 1.0]
    } else if ratio < 32.0 {
        &[8.0, 4.0, 2.0, 1.0]
    } else {
        &[16.0, 8.0, 4.0, 2.0, 1.0]
    };
    scales
        .iter()
        .enumerate()
        .map(|(i, reduction)| ResponsiveCandidate {
            reduction: *reduction,
            density: 2u32.pow(i as u32 + 1),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn table(ratios: &[f32]) -> Vec<ReductionFactor> {
        ratios.iter().copied().map(ReductionFactor::new).collect()
    }

    #[test]
    fn quantize_breaks_ties_toward_smaller_ratio() {
        let factors = table(&[0.5, 1.0, 2.0]);
        assert_eq!(quantize(1.5, &factors).unwrap().ratio, 1.0);
        assert_eq!(quantize(0.75, &factors).unwrap().ratio, 0.5);
        assert_eq!(quantize(10.0, &factors).unwrap().ratio, 2.0);
        assert!(quantize(1.0, &[]).is_none());
    }

    #[test]
    fn quantize_minimises_distance_for_random_requests() {
        let mut rng = StdRng::seed_from_u64(7);
        let factors = table(&[0.25, 0.5, 1.0, 2.0, 3.0, 4.0, 6.0, 16.0]);
        for _ in 0..500 {
            let requested: f32 = rng.gen_range(0.0..20.0);
            let picked = quantize(requested, &factors).unwrap();
            let best = factors
                .iter()
                .map(|f| (f.ratio - requested).abs())
                .fold(f32::INFINITY, f32::min);
            assert_eq!((picked.ratio - requested).abs(), best);
        }
    }

    #[test]
    fn zooming_in_walks_down_to_the_first_factor() {
        let factors = table(&[0.5, 1.0, 2.0, 3.0, 4.0, 6.0]);
        let mut current = factors.last().unwrap().ratio;
        let mut visited = vec![current];
        loop {
            let next = next(current, ZoomDirection::In, &factors).unwrap().ratio;
            if next == current {
                break;
            }
            assert!(next < current);
            visited.push(next);
            current = next;
            assert!(visited.len() <= factors.len());
        }
        assert_eq!(current, factors[0].ratio);
        assert_eq!(visited.len(), factors.len());
    }

    #[test]
    fn zooming_in_from_arbitrary_ratios_never_cycles() {
        let mut rng = StdRng::seed_from_u64(42);
        let factors = table(&[0.5, 1.0, 2.0, 3.0, 4.0, 6.0]);
        for _ in 0..100 {
            let mut current: f32 = rng.gen_range(0.1..12.0);
            for _ in 0..=factors.len() {
                current = next(current, ZoomDirection::In, &factors).unwrap().ratio;
            }
            assert_eq!(current, 0.5);
        }
    }

    #[test]
    fn zooming_out_steps_up_and_saturates() {
        let factors = table(&[0.5, 1.0, 2.0]);
        assert_eq!(next(1.0, ZoomDirection::Out, &factors).unwrap().ratio, 2.0);
        assert_eq!(next(1.5, ZoomDirection::Out, &factors).unwrap().ratio, 2.0);
        assert_eq!(next(2.0, ZoomDirection::Out, &factors).unwrap().ratio, 2.0);
        assert_eq!(next(0.1, ZoomDirection::In, &factors).unwrap().ratio, 0.5);
    }

    #[test]
    fn auto_prefers_tagged_entry_then_largest_fit() {
        let mut factors = table(&[0.5, 1.0, 4.0]);
        factors.insert(2, ReductionFactor::autofit(2.5, AutofitClass::Height));
        factors.insert(3, ReductionFactor::autofit(3.5, AutofitClass::Width));
        assert_eq!(next(1.0, ZoomDirection::Auto, &factors).unwrap().ratio, 3.5);
        assert_eq!(next(1.0, ZoomDirection::Height, &factors).unwrap().ratio, 2.5);

        factors.insert(1, ReductionFactor::autofit(0.8, AutofitClass::Auto));
        assert_eq!(next(4.0, ZoomDirection::Auto, &factors).unwrap().ratio, 0.8);

        let plain = table(&[0.5, 1.0]);
        assert_eq!(next(1.0, ZoomDirection::Auto, &plain).unwrap().ratio, 0.5);
        assert_eq!(next(1.0, ZoomDirection::Width, &plain).unwrap().ratio, 0.5);
    }

    #[test]
    fn table_validation_rejects_bad_input() {
        assert!(matches!(
            ReductionTable::from_ratios(&[]),
            Err(ConfigError::EmptyReductionTable)
        ));
        assert!(matches!(
            ReductionTable::from_ratios(&[1.0, 0.0]),
            Err(ConfigError::InvalidRatio(_))
        ));
        assert!(matches!(
            ReductionTable::from_ratios(&[2.0, 1.0]),
            Err(ConfigError::Unsorted { .. })
        ));
        assert!(matches!(
            ReductionTable::new(vec![
                ReductionFactor::autofit(1.0, AutofitClass::Auto),
                ReductionFactor::autofit(2.0, AutofitClass::Auto),
            ]),
            Err(ConfigError::DuplicateAuto)
        ));
    }

    #[test]
    fn single_page_table_adds_both_autofits_in_order() {
        let base = ReductionTable::from_ratios(&[0.5, 1.0, 2.0, 3.0, 4.0, 6.0]).unwrap();
        let median = PageSize {
            width: 1600.0,
            height: 2400.0,
        };
        let viewport = ViewportSize::new(880.0, 820.0);
        let table = single_page_table(&base, median, viewport, 10.0);
        let factors = table.factors();
        assert_eq!(factors.len(), 8);
        assert!(factors.windows(2).all(|w| w[0].ratio <= w[1].ratio));
        assert_eq!(table.next(1.0, ZoomDirection::Height).ratio, 3.0);
        assert_eq!(table.next(1.0, ZoomDirection::Width).ratio, 2.0);
        assert_eq!(table.next(1.0, ZoomDirection::Auto).ratio, 3.0);
    }

    #[test]
    fn extras_never_duplicate_classes() {
        let base = ReductionTable::from_ratios(&[1.0, 2.0]).unwrap();
        let table = spread_table(&base, 1.5);
        let again = spread_table(&table, 1.7);
        assert_eq!(again.factors().len(), 3);
        assert_eq!(again.next(1.0, ZoomDirection::Auto).ratio, 1.5);
        assert_eq!(spread_table(&base, f32::NAN).factors().len(), 2);
    }

    #[test]
    fn thumbnail_reduction_rounds_to_even() {
        assert_eq!(thumbnail_reduction(1000, 100.0), 10.0);
        assert_eq!(thumbnail_reduction(900, 100.0), 10.0);
        assert_eq!(thumbnail_reduction(700, 100.0), 8.0);
        assert_eq!(thumbnail_reduction(150, 100.0), 2.0);
        assert_eq!(thumbnail_reduction(50, 100.0), 1.0);
    }

    #[test]
    fn responsive_scales_follow_power_of_two_ladder() {
        assert!(responsive_scales(1.5).is_empty());
        assert_eq!(
            responsive_scales(5.0),
            vec![
                ResponsiveCandidate {
                    reduction: 2.0,
                    density: 2
                },
                ResponsiveCandidate {
                    reduction: 1.0,
                    density: 4
                },
            ]
        );
        assert_eq!(responsive_scales(40.0).len(), 5);
        assert_eq!(responsive_scales(40.0)[4].density, 32);
    }

    #[test]
    fn zoom_direction_parses_names() {
        assert_eq!("in".parse::<ZoomDirection>().unwrap(), ZoomDirection::In);
        assert_eq!(ZoomDirection::Width.to_string(), "width");
        assert!("sideways".parse::<ZoomDirection>().is_err());
    }
}
