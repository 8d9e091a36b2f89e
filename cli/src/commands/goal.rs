use anyhow::{Result, bail};

use nibble_core::models::GoalConfiguration;

use crate::config::Config;

/// Build a goal from a calorie target and an optional, all-or-nothing macro split.
fn build_goal(
    calories: f64,
    protein: Option<i64>,
    carbs: Option<i64>,
    fat: Option<i64>,
) -> Result<GoalConfiguration> {
    if !calories.is_finite() || calories <= 0.0 {
        bail!("Calorie goal must be greater than 0");
    }
    match (protein, carbs, fat) {
        (None, None, None) => Ok(GoalConfiguration::calories_only(calories)),
        (Some(p), Some(c), Some(f)) => GoalConfiguration::from_macro_split(calories, p, c, f),
        _ => bail!(
            "If setting macro percentages, all three (--protein, --carbs, --fat) must be provided"
        ),
    }
}

fn print_goal(goal: &GoalConfiguration) {
    let cal = goal.daily_calories;
    if let (Some(p), Some(c), Some(f)) = (goal.protein_g, goal.carbs_g, goal.fat_g) {
        println!("Daily goal: {cal:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g");
    } else {
        println!("Daily goal: {cal:.0} kcal");
    }
}

pub(crate) fn cmd_goal_set(
    config: &mut Config,
    calories: f64,
    protein: Option<i64>,
    carbs: Option<i64>,
    fat: Option<i64>,
    json: bool,
) -> Result<()> {
    let goal = build_goal(calories, protein, carbs, fat)?;
    config.file.goal = Some(goal.clone());
    config.save()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&goal)?);
    } else {
        print_goal(&goal);
    }
    Ok(())
}

pub(crate) fn cmd_goal_show(config: &Config, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.goal())?);
        return Ok(());
    }
    match config.goal() {
        Some(goal) => print_goal(goal),
        None => println!("No goal set. Use `nibble goal set <calories>`"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calories_only_goal() {
        let goal = build_goal(2000.0, None, None, None).unwrap();
        assert_eq!(goal, GoalConfiguration::calories_only(2000.0));
    }

    #[test]
    fn test_macro_goal() {
        let goal = build_goal(2000.0, Some(30), Some(40), Some(30)).unwrap();
        assert!((goal.protein_g.unwrap() - 150.0).abs() < 0.01);
        assert!((goal.carbs_g.unwrap() - 200.0).abs() < 0.01);
        assert!((goal.fat_g.unwrap() - 66.67).abs() < 0.01);
    }

    #[test]
    fn test_partial_split_rejected() {
        assert!(build_goal(2000.0, Some(30), None, Some(30)).is_err());
        assert!(build_goal(0.0, None, None, None).is_err());
        assert!(build_goal(2000.0, Some(50), Some(50), Some(50)).is_err());
    }

    #[test]
    fn test_set_goal_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::in_dir(dir.path()).unwrap();
        cmd_goal_set(&mut config, 1800.0, None, None, None, true).unwrap();

        let reloaded = Config::in_dir(dir.path()).unwrap();
        assert_eq!(
            reloaded.goal(),
            Some(&GoalConfiguration::calories_only(1800.0))
        );
    }
}
