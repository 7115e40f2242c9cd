//! Grid collapse for cumulative entities.
//!
//! A column of "balance as of P" cells for one entity is answered with two
//! calls: the balance as of the month before the first requested period (the
//! anchor) and the per-month activity across the span. Each requested period
//! is then the anchor plus a running sum.

use crate::period::Period;
use std::collections::{BTreeMap, BTreeSet};

/// One collapsible run of periods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPlan {
    /// Month immediately before `first`.
    pub anchor: Period,
    pub first: Period,
    pub last: Period,
    /// Requested periods within `first..=last`, oldest first.
    pub requested: Vec<Period>,
}

impl GridPlan {
    /// Every month of the breakdown, gaps included.
    pub fn span(&self) -> Vec<Period> {
        Period::span(self.first, self.last).collect()
    }

    /// Turn the anchor value and the per-month breakdown into as-of values.
    ///
    /// Fails with the first month missing from `breakdown`; a missing month is
    /// unknown, never zero.
    pub fn assemble(
        &self,
        anchor_value: f64,
        breakdown: &BTreeMap<Period, f64>,
    ) -> Result<BTreeMap<Period, f64>, Period> {
        let requested: BTreeSet<Period> = self.requested.iter().copied().collect();
        let mut running = anchor_value;
        let mut out = BTreeMap::new();
        for period in Period::span(self.first, self.last) {
            running += *breakdown.get(&period).ok_or(period)?;
            if requested.contains(&period) {
                out.insert(period, running);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridLayout {
    pub grids: Vec<GridPlan>,
    /// Periods that do not belong to any collapsible run.
    pub singles: Vec<Period>,
}

#[derive(Debug, Clone, Copy)]
pub struct GridPatternDetector {
    max_gap: u32,
}

impl GridPatternDetector {
    pub fn new(max_gap: u32) -> Self {
        Self { max_gap }
    }

    /// Split the requested periods of one (entity, filter set) into runs whose
    /// adjacent periods are at most `max_gap` months apart. Runs of two or
    /// more periods collapse; isolated periods are fetched on their own.
    pub fn plan(&self, periods: impl IntoIterator<Item = Period>) -> GridLayout {
        let periods: BTreeSet<Period> = periods.into_iter().collect();
        let mut layout = GridLayout::default();
        let mut run: Vec<Period> = Vec::new();

        for period in periods {
            if let Some(&prev) = run.last() {
                if prev.months_until(period) > i64::from(self.max_gap) {
                    self.close_run(&mut layout, std::mem::take(&mut run));
                }
            }
            run.push(period);
        }
        self.close_run(&mut layout, run);
        layout
    }

    fn close_run(&self, layout: &mut GridLayout, run: Vec<Period>) {
        match run.as_slice() {
            [] => {}
            [single] => layout.singles.push(*single),
            [first, .., last] => layout.grids.push(GridPlan {
                anchor: first.pred(),
                first: *first,
                last: *last,
                requested: run.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn p(year: i32, month: u32) -> Period {
        Period::new(year, month).unwrap()
    }

    #[test]
    fn contiguous_months_collapse_into_one_grid() {
        let layout = GridPatternDetector::new(2).plan([p(2025, 3), p(2025, 1), p(2025, 4), p(2025, 2)]);
        assert_eq!(
            layout,
            GridLayout {
                grids: vec![GridPlan {
                    anchor: p(2024, 12),
                    first: p(2025, 1),
                    last: p(2025, 4),
                    requested: vec![p(2025, 1), p(2025, 2), p(2025, 3), p(2025, 4)],
                }],
                singles: vec![],
            }
        );
    }

    #[test]
    fn wide_gaps_do_not_collapse() {
        let layout = GridPatternDetector::new(2).plan([p(2025, 1), p(2025, 7)]);
        assert!(layout.grids.is_empty());
        assert_eq!(layout.singles, vec![p(2025, 1), p(2025, 7)]);
    }

    #[test]
    fn near_contiguous_runs_collapse_up_to_the_threshold() {
        let layout = GridPatternDetector::new(2).plan([p(2025, 1), p(2025, 3), p(2025, 9), p(2025, 10)]);
        assert_eq!(layout.grids.len(), 2);
        assert_eq!(layout.grids[0].span().len(), 3);
        assert_eq!(layout.grids[1].anchor, p(2025, 8));
        assert!(layout.singles.is_empty());

        let strict = GridPatternDetector::new(1).plan([p(2025, 1), p(2025, 3)]);
        assert!(strict.grids.is_empty());
    }

    #[test]
    fn single_period_is_not_a_grid() {
        let layout = GridPatternDetector::new(2).plan([p(2025, 5), p(2025, 5)]);
        assert_eq!(layout.singles, vec![p(2025, 5)]);
    }

    #[test]
    fn running_sum_from_the_anchor() {
        let plan = GridPatternDetector::new(2)
            .plan([p(2025, 1), p(2025, 3)])
            .grids
            .remove(0);
        let breakdown = BTreeMap::from([(p(2025, 1), 10.0), (p(2025, 2), 5.0), (p(2025, 3), -2.5)]);
        let values = plan.assemble(100.0, &breakdown).unwrap();
        assert_eq!(values, BTreeMap::from([(p(2025, 1), 110.0), (p(2025, 3), 112.5)]));
    }

    #[test]
    fn missing_breakdown_month_is_reported() {
        let plan = GridPatternDetector::new(2)
            .plan([p(2025, 1), p(2025, 2)])
            .grids
            .remove(0);
        let breakdown = BTreeMap::from([(p(2025, 1), 10.0)]);
        assert_eq!(plan.assemble(0.0, &breakdown), Err(p(2025, 2)));
    }
}
