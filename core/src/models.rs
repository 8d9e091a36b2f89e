use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Server-assigned entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MealCategory {
    Breakfast,
    Lunch,
    Dinner,
    Snacks,
}

impl MealCategory {
    pub const ALL: [MealCategory; 4] = [
        MealCategory::Breakfast,
        MealCategory::Lunch,
        MealCategory::Dinner,
        MealCategory::Snacks,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Dinner => "dinner",
            Self::Snacks => "snacks",
        }
    }
}

impl fmt::Display for MealCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid meal category '{0}'. Must be one of: breakfast, lunch, dinner, snacks")]
pub struct ParseCategoryError(String);

impl FromStr for MealCategory {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "breakfast" => Ok(Self::Breakfast),
            "lunch" => Ok(Self::Lunch),
            "dinner" => Ok(Self::Dinner),
            "snacks" | "snack" => Ok(Self::Snacks),
            _ => Err(ParseCategoryError(s.to_string())),
        }
    }
}

/// One logged nutrition record, as confirmed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub user_id: UserId,
    pub category: MealCategory,
    pub name: String,
    #[serde(default)]
    pub quantity: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub calories: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub protein: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub carbs: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An entry as submitted by a consumer, before the store assigns identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub category: MealCategory,
    pub name: String,
    #[serde(default)]
    pub quantity: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub calories: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub protein: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub carbs: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub fat: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub date: NaiveDate,
}

fn deserialize_some<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial update. `None` leaves a field untouched; `notes: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(clippy::option_option)]
pub struct EntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<MealCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_some"
    )]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl EntryPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Write the patched fields onto `entry`. Timestamps are left to the store.
    pub fn apply_to(&self, entry: &mut Entry) {
        if let Some(category) = self.category {
            entry.category = category;
        }
        if let Some(name) = &self.name {
            entry.name.clone_from(name);
        }
        if let Some(quantity) = &self.quantity {
            entry.quantity.clone_from(quantity);
        }
        if let Some(calories) = self.calories {
            entry.calories = calories;
        }
        if let Some(protein) = self.protein {
            entry.protein = protein;
        }
        if let Some(carbs) = self.carbs {
            entry.carbs = carbs;
        }
        if let Some(fat) = self.fat {
            entry.fat = fat;
        }
        if let Some(notes) = &self.notes {
            entry.notes.clone_from(notes);
        }
        if let Some(date) = self.date {
            entry.date = date;
        }
    }
}

/// What a delete notification carries: the id plus enough of the old row to route it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryShadow {
    pub id: EntryId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl From<&Entry> for EntryShadow {
    fn from(entry: &Entry) -> Self {
        Self {
            id: entry.id.clone(),
            user_id: entry.user_id.clone(),
            date: Some(entry.date),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification from the store's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert(Entry),
    Update(Entry),
    Delete(EntryShadow),
}

impl ChangeEvent {
    #[must_use]
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    #[must_use]
    pub fn entry_id(&self) -> &EntryId {
        match self {
            Self::Insert(entry) | Self::Update(entry) => &entry.id,
            Self::Delete(shadow) => &shadow.id,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        match self {
            Self::Insert(entry) | Self::Update(entry) => &entry.user_id,
            Self::Delete(shadow) => &shadow.user_id,
        }
    }

    #[must_use]
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Insert(entry) | Self::Update(entry) => Some(entry.date),
            Self::Delete(shadow) => shadow.date,
        }
    }
}

/// A change as recorded in the store's change log, with its feed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: i64,
    pub event: ChangeEvent,
}

/// One page of the polled change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<ChangeRecord>,
    pub cursor: i64,
}

/// Per-user targets. Read-only for the sync layer; owned by the user profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalConfiguration {
    pub daily_calories: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs_g: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat_g: Option<f64>,
}

impl GoalConfiguration {
    #[must_use]
    pub fn calories_only(daily_calories: f64) -> Self {
        Self {
            daily_calories,
            protein_g: None,
            carbs_g: None,
            fat_g: None,
        }
    }

    /// Build a goal from a calorie target and a macro split in percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_macro_split(
        daily_calories: f64,
        protein_pct: i64,
        carbs_pct: i64,
        fat_pct: i64,
    ) -> Result<Self> {
        if !daily_calories.is_finite() || daily_calories <= 0.0 {
            bail!("Calorie goal must be greater than 0");
        }
        validate_macro_split(protein_pct, carbs_pct, fat_pct)?;
        Ok(Self {
            daily_calories,
            protein_g: Some(daily_calories * protein_pct as f64 / 100.0 / 4.0),
            carbs_g: Some(daily_calories * carbs_pct as f64 / 100.0 / 4.0),
            fat_g: Some(daily_calories * fat_pct as f64 / 100.0 / 9.0),
        })
    }
}

pub fn validate_macro_split(protein: i64, carbs: i64, fat: i64) -> Result<()> {
    if protein < 0 || carbs < 0 || fat < 0 {
        bail!("Macro percentages must be non-negative");
    }
    if protein > 100 || carbs > 100 || fat > 100 {
        bail!("Each macro percentage must be between 0 and 100");
    }
    let sum = protein + carbs + fat;
    if sum != 100 {
        bail!("Macro percentages must sum to 100 (got {sum})");
    }
    Ok(())
}

/// Summed macros over a set of entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroTotals {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
}

/// Coerce a loosely-typed JSON value to a finite number, falling back to 0.
#[must_use]
pub fn coerce_number(value: &serde_json::Value) -> f64 {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() { n } else { 0.0 }
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(coerce_number(&value))
}

pub fn parse_category(category: &str) -> Result<MealCategory> {
    Ok(category.parse()?)
}

fn validate_macro_value(label: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        bail!("{label} must be a finite number");
    }
    if value < 0.0 {
        bail!("{label} must not be negative");
    }
    Ok(())
}

/// Validate a new entry: name must not be blank, macros must be finite and non-negative.
pub fn validate_new_entry(entry: &NewEntry) -> Result<()> {
    if entry.name.trim().is_empty() {
        bail!("Entry name must not be empty");
    }
    validate_macro_value("calories", entry.calories)?;
    validate_macro_value("protein", entry.protein)?;
    validate_macro_value("carbs", entry.carbs)?;
    validate_macro_value("fat", entry.fat)?;
    Ok(())
}

/// Validate a partial update: at least one field, and each provided field well-formed.
pub fn validate_patch(patch: &EntryPatch) -> Result<()> {
    if patch.is_empty() {
        bail!("Nothing to update");
    }
    if patch.name.as_ref().is_some_and(|n| n.trim().is_empty()) {
        bail!("Entry name must not be empty");
    }
    for (label, value) in [
        ("calories", patch.calories),
        ("protein", patch.protein),
        ("carbs", patch.carbs),
        ("fat", patch.fat),
    ] {
        if let Some(v) = value {
            validate_macro_value(label, v)?;
        }
    }
    Ok(())
}

/// Order a day's entries by creation time; ties fall back to id.
pub fn sort_by_creation(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
