/// One-decimal rounding used for every synced percentage:
/// `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Running totals over a student's homework items for one course. The
/// aggregate is always rebuilt from scratch on every relevant write; there is
/// deliberately no incremental adjustment path.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HomeworkTotals {
    pub points: f64,
    pub max_points: f64,
}

impl HomeworkTotals {
    pub fn add(&mut self, points: f64, max_points: f64) {
        self.points += points;
        self.max_points += max_points;
    }

    /// Weighted percentage on the 0-100 scale, one decimal. A student with no
    /// gradable homework (or all-zero maxima) scores 0.
    pub fn percent(&self) -> f64 {
        if self.max_points <= 0.0 {
            return 0.0;
        }
        round_off_1_decimal(100.0 * self.points / self.max_points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_off_one_decimal_half_up() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(66.64), 66.6);
        assert_eq!(round_off_1_decimal(66.66666), 66.7);
        assert_eq!(round_off_1_decimal(87.5), 87.5);
    }

    #[test]
    fn homework_percent_weighted_by_points() {
        let mut totals = HomeworkTotals::default();
        totals.add(80.0, 100.0);
        totals.add(60.0, 100.0);
        assert_eq!(totals.percent(), 70.0);
    }

    #[test]
    fn uneven_maxima_weight_by_size_not_by_item() {
        // 10/10 and 0/90 is 10%, not the 50% an item-average would give.
        let mut totals = HomeworkTotals::default();
        totals.add(10.0, 10.0);
        totals.add(0.0, 90.0);
        assert_eq!(totals.percent(), 10.0);
    }

    #[test]
    fn zero_max_points_scores_zero() {
        let totals = HomeworkTotals::default();
        assert_eq!(totals.percent(), 0.0);

        let mut only_zero_max = HomeworkTotals::default();
        only_zero_max.add(5.0, 0.0);
        assert_eq!(only_zero_max.percent(), 0.0);
    }
}
