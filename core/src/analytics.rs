//! Derived numbers over cached entries. Everything here is pure and recomputed on read.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::models::{Entry, GoalConfiguration, MacroTotals, MealCategory};
use crate::store::DateRange;

pub const DEFAULT_TOLERANCE_CALORIES: f64 = 100.0;

const WEEK_DAYS: u32 = 7;
const FLAT_EPSILON: f64 = 1e-9;

fn finite(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Calories,
    Protein,
    Carbs,
    Fat,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Calories, Metric::Protein, Metric::Carbs, Metric::Fat];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calories => "calories",
            Self::Protein => "protein",
            Self::Carbs => "carbs",
            Self::Fat => "fat",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "calories" | "kcal" => Ok(Self::Calories),
            "protein" => Ok(Self::Protein),
            "carbs" => Ok(Self::Carbs),
            "fat" => Ok(Self::Fat),
            _ => anyhow::bail!("Unknown metric '{s}'. Must be one of: calories, protein, carbs, fat"),
        }
    }
}

impl MacroTotals {
    #[must_use]
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Calories => self.calories,
            Metric::Protein => self.protein,
            Metric::Carbs => self.carbs,
            Metric::Fat => self.fat,
        }
    }

    fn add(&mut self, entry: &Entry) {
        self.calories += finite(entry.calories);
        self.protein += finite(entry.protein);
        self.carbs += finite(entry.carbs);
        self.fat += finite(entry.fat);
    }
}

pub fn daily_totals<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> MacroTotals {
    let mut totals = MacroTotals::default();
    for entry in entries {
        totals.add(entry);
    }
    totals
}

/// Calories left for the day. Negative once the goal is exceeded.
#[must_use]
pub fn remaining_calories(totals: &MacroTotals, goal: &GoalConfiguration) -> f64 {
    goal.daily_calories - totals.calories
}

pub fn totals_by_date<'a>(
    entries: impl IntoIterator<Item = &'a Entry>,
) -> BTreeMap<NaiveDate, MacroTotals> {
    let mut by_date: BTreeMap<NaiveDate, MacroTotals> = BTreeMap::new();
    for entry in entries {
        by_date.entry(entry.date).or_default().add(entry);
    }
    by_date
}

/// Consecutive days with entries, walking back from `anchor`. Zero if `anchor` has none.
#[must_use]
pub fn consecutive_day_streak(dates: &BTreeSet<NaiveDate>, anchor: NaiveDate) -> u32 {
    let mut streak = 0;
    let mut day = anchor;
    while dates.contains(&day) {
        streak += 1;
        day -= Duration::days(1);
    }
    streak
}

/// Longest run of consecutive days anywhere in `dates`.
#[must_use]
pub fn longest_streak(dates: &BTreeSet<NaiveDate>) -> u32 {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<NaiveDate> = None;
    for date in dates {
        current = match previous {
            Some(prev) if *date - prev == Duration::days(1) => current + 1,
            _ => 1,
        };
        longest = longest.max(current);
        previous = Some(*date);
    }
    longest
}

/// Mean of `metric` over the days that have entries in the 7 days ending at `anchor`.
///
/// Days without entries do not count toward the divisor.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn weekly_average(entries: &[Entry], metric: Metric, anchor: NaiveDate) -> f64 {
    let week = DateRange::lookback(anchor, WEEK_DAYS);
    let by_date = totals_by_date(entries.iter().filter(|e| week.contains(e.date)));
    if by_date.is_empty() {
        return 0.0;
    }
    let sum: f64 = by_date.values().map(|t| t.get(metric)).sum();
    sum / by_date.len() as f64
}

#[must_use]
pub fn within_goal(totals: &MacroTotals, goal: &GoalConfiguration, tolerance: f64) -> bool {
    (totals.calories - goal.daily_calories).abs() <= tolerance
}

#[must_use]
pub fn goal_achievement_count(
    totals: &BTreeMap<NaiveDate, MacroTotals>,
    goal: &GoalConfiguration,
    tolerance: f64,
) -> u32 {
    let hits = totals
        .values()
        .filter(|t| within_goal(t, goal, tolerance))
        .count();
    u32::try_from(hits).unwrap_or(u32::MAX)
}

/// Share of the 7 days ending at `anchor` that landed on target.
///
/// Always divides by 7: a day without entries counts as a miss.
#[must_use]
pub fn goal_achievement_rate(
    totals: &BTreeMap<NaiveDate, MacroTotals>,
    goal: &GoalConfiguration,
    tolerance: f64,
    anchor: NaiveDate,
) -> f64 {
    let week = DateRange::lookback(anchor, WEEK_DAYS);
    let in_week: BTreeMap<NaiveDate, MacroTotals> = totals
        .iter()
        .filter(|(date, _)| week.contains(**date))
        .map(|(date, t)| (*date, *t))
        .collect();
    f64::from(goal_achievement_count(&in_week, goal, tolerance)) / f64::from(WEEK_DAYS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendDelta {
    pub delta: f64,
    pub direction: TrendDirection,
}

impl TrendDelta {
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        self.delta.abs()
    }
}

#[must_use]
pub fn trend_delta(current: f64, previous: f64) -> TrendDelta {
    let delta = finite(current) - finite(previous);
    let direction = if delta > FLAT_EPSILON {
        TrendDirection::Up
    } else if delta < -FLAT_EPSILON {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    };
    TrendDelta { delta, direction }
}

/// Inputs to achievement predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AchievementStats {
    pub entry_count: u32,
    pub days_logged: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub max_daily_protein: f64,
    pub goal_days: u32,
    pub max_categories_in_day: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatMetric {
    EntryCount,
    DaysLogged,
    CurrentStreak,
    LongestStreak,
    MaxDailyProtein,
    GoalDays,
    CategoriesInDay,
}

impl AchievementStats {
    pub fn compute(entries: &[Entry], anchor: NaiveDate, goal: Option<&GoalConfiguration>) -> Self {
        let by_date = totals_by_date(entries);
        let dates: BTreeSet<NaiveDate> = by_date.keys().copied().collect();

        let mut categories: BTreeMap<NaiveDate, BTreeSet<MealCategory>> = BTreeMap::new();
        for entry in entries {
            categories.entry(entry.date).or_default().insert(entry.category);
        }
        let max_categories = categories.values().map(BTreeSet::len).max().unwrap_or(0);

        Self {
            entry_count: u32::try_from(entries.len()).unwrap_or(u32::MAX),
            days_logged: u32::try_from(dates.len()).unwrap_or(u32::MAX),
            current_streak: consecutive_day_streak(&dates, anchor),
            longest_streak: longest_streak(&dates),
            max_daily_protein: by_date.values().map(|t| t.protein).fold(0.0, f64::max),
            goal_days: goal.map_or(0, |g| {
                goal_achievement_count(&by_date, g, DEFAULT_TOLERANCE_CALORIES)
            }),
            max_categories_in_day: u32::try_from(max_categories).unwrap_or(u32::MAX),
        }
    }

    #[must_use]
    pub fn value(&self, metric: StatMetric) -> f64 {
        match metric {
            StatMetric::EntryCount => f64::from(self.entry_count),
            StatMetric::DaysLogged => f64::from(self.days_logged),
            StatMetric::CurrentStreak => f64::from(self.current_streak),
            StatMetric::LongestStreak => f64::from(self.longest_streak),
            StatMetric::MaxDailyProtein => self.max_daily_protein,
            StatMetric::GoalDays => f64::from(self.goal_days),
            StatMetric::CategoriesInDay => f64::from(self.max_categories_in_day),
        }
    }
}

/// A threshold over one stat. Unlocked once `stats.value(metric) >= threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Achievement {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub metric: StatMetric,
    pub threshold: f64,
}

impl Achievement {
    #[must_use]
    pub fn is_unlocked(&self, stats: &AchievementStats) -> bool {
        stats.value(self.metric) >= self.threshold
    }
}

pub const ACHIEVEMENTS: &[Achievement] = &[
    Achievement {
        id: "first_meal",
        name: "First Bite",
        description: "Log your first entry",
        metric: StatMetric::EntryCount,
        threshold: 1.0,
    },
    Achievement {
        id: "ten_entries",
        name: "Getting the Hang of It",
        description: "Log 10 entries",
        metric: StatMetric::EntryCount,
        threshold: 10.0,
    },
    Achievement {
        id: "streak_3",
        name: "Three in a Row",
        description: "Log something 3 days running",
        metric: StatMetric::CurrentStreak,
        threshold: 3.0,
    },
    Achievement {
        id: "week_streak",
        name: "Full Week",
        description: "Log something 7 days running",
        metric: StatMetric::CurrentStreak,
        threshold: 7.0,
    },
    Achievement {
        id: "month_streak",
        name: "Habit Formed",
        description: "Log something 30 days running",
        metric: StatMetric::CurrentStreak,
        threshold: 30.0,
    },
    Achievement {
        id: "protein_100",
        name: "Protein Pro",
        description: "Eat at least 100g of protein in one day",
        metric: StatMetric::MaxDailyProtein,
        threshold: 100.0,
    },
    Achievement {
        id: "on_target",
        name: "Bullseye",
        description: "Finish a day within 100 kcal of your goal",
        metric: StatMetric::GoalDays,
        threshold: 1.0,
    },
    Achievement {
        id: "consistent",
        name: "Steady Hand",
        description: "Finish 5 days within 100 kcal of your goal",
        metric: StatMetric::GoalDays,
        threshold: 5.0,
    },
    Achievement {
        id: "full_day",
        name: "Square Meals",
        description: "Log breakfast, lunch, dinner and a snack on the same day",
        metric: StatMetric::CategoriesInDay,
        threshold: 4.0,
    },
];

#[must_use]
pub fn find_achievement(id: &str) -> Option<&'static Achievement> {
    ACHIEVEMENTS.iter().find(|a| a.id == id)
}

/// Achievements whose predicate holds now and that are not already in `unlocked`.
#[must_use]
pub fn unlocked_achievements(
    stats: &AchievementStats,
    definitions: &[Achievement],
    unlocked: &BTreeSet<String>,
) -> Vec<Achievement> {
    definitions
        .iter()
        .filter(|a| a.is_unlocked(stats) && !unlocked.contains(a.id))
        .copied()
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryGroup {
    pub category: MealCategory,
    pub entries: Vec<Entry>,
    pub subtotal: MacroTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub categories: Vec<CategoryGroup>,
    pub totals: MacroTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<GoalConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_calories: Option<f64>,
}

/// One day's entries grouped by meal category, with subtotals. Empty categories are omitted.
#[must_use]
pub fn day_summary(
    date: NaiveDate,
    entries: &[Entry],
    goal: Option<&GoalConfiguration>,
) -> DaySummary {
    let mut categories = Vec::new();
    for category in MealCategory::ALL {
        let group: Vec<Entry> = entries
            .iter()
            .filter(|e| e.date == date && e.category == category)
            .cloned()
            .collect();
        if group.is_empty() {
            continue;
        }
        let subtotal = daily_totals(&group);
        categories.push(CategoryGroup {
            category,
            entries: group,
            subtotal,
        });
    }

    let totals = daily_totals(categories.iter().flat_map(|g| &g.entries));
    DaySummary {
        date,
        categories,
        totals,
        goal: goal.cloned(),
        remaining_calories: goal.map(|g| remaining_calories(&totals, g)),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricTrend {
    pub metric: Metric,
    pub current: f64,
    pub previous: f64,
    pub trend: TrendDelta,
}

/// This week against last week, per metric.
#[derive(Debug, Clone, Serialize)]
pub struct WeeklyReport {
    pub anchor: NaiveDate,
    pub days_logged: u32,
    pub trends: Vec<MetricTrend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub achievement_rate: Option<f64>,
}

#[must_use]
pub fn weekly_report(
    entries: &[Entry],
    goal: Option<&GoalConfiguration>,
    anchor: NaiveDate,
) -> WeeklyReport {
    let previous_anchor = anchor - Duration::days(i64::from(WEEK_DAYS));
    let trends = Metric::ALL
        .iter()
        .map(|&metric| {
            let current = weekly_average(entries, metric, anchor);
            let previous = weekly_average(entries, metric, previous_anchor);
            MetricTrend {
                metric,
                current,
                previous,
                trend: trend_delta(current, previous),
            }
        })
        .collect();

    let week = DateRange::lookback(anchor, WEEK_DAYS);
    let by_date: BTreeMap<NaiveDate, MacroTotals> = totals_by_date(entries)
        .into_iter()
        .filter(|(date, _)| week.contains(*date))
        .collect();

    WeeklyReport {
        anchor,
        days_logged: u32::try_from(by_date.len()).unwrap_or(u32::MAX),
        trends,
        goal_days: goal.map(|g| goal_achievement_count(&by_date, g, DEFAULT_TOLERANCE_CALORIES)),
        achievement_rate: goal
            .map(|g| goal_achievement_rate(&by_date, g, DEFAULT_TOLERANCE_CALORIES, anchor)),
    }
}

/// Everything a home screen shows, computed from one snapshot of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub today: DaySummary,
    pub streak: u32,
    pub week: WeeklyReport,
    pub stats: AchievementStats,
    pub newly_unlocked: Vec<Achievement>,
}

#[must_use]
pub fn dashboard(
    entries: &[Entry],
    goal: Option<&GoalConfiguration>,
    anchor: NaiveDate,
    unlocked: &BTreeSet<String>,
) -> Dashboard {
    let stats = AchievementStats::compute(entries, anchor, goal);
    Dashboard {
        today: day_summary(anchor, entries, goal),
        streak: stats.current_streak,
        week: weekly_report(entries, goal, anchor),
        newly_unlocked: unlocked_achievements(&stats, ACHIEVEMENTS, unlocked),
        stats,
    }
}
