//! Visualization Selector
//!
//! Picks a chart family and axis bindings from the shape of a result set.
//! Selection never fails: anything that does not fit a chart is shown as a
//! table, with the reason recorded on the returned `ChartSpec`.

use crate::execution::result::{ResultColumn, ResultSet, Scalar};
use crate::table::ColumnType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Most categories a bar or pie chart will show
pub const MAX_CATEGORIES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Table,
    Bar,
    Line,
    Pie,
    Scatter,
}

impl ChartKind {
    /// Lenient parse of a generator-supplied chart name
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "table" => Some(ChartKind::Table),
            "bar" => Some(ChartKind::Bar),
            "line" => Some(ChartKind::Line),
            "pie" => Some(ChartKind::Pie),
            "scatter" => Some(ChartKind::Scatter),
            _ => None,
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChartKind::Table => "table",
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Pie => "pie",
            ChartKind::Scatter => "scatter",
        };
        write!(f, "{}", name)
    }
}

/// What the generator suggested; advisory only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationHint {
    pub chart: Option<ChartKind>,
    pub x: Option<String>,
    pub y: Option<String>,
}

/// Display formatting for chart labels and table cells
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattingHints {
    pub x_title: Option<String>,
    pub y_title: Option<String>,
    pub decimal_places: usize,
    pub date_format: String,
    pub timestamp_format: String,
}

impl Default for FormattingHints {
    fn default() -> Self {
        Self {
            x_title: None,
            y_title: None,
            decimal_places: 2,
            date_format: "%Y-%m-%d".to_string(),
            timestamp_format: "%Y-%m-%d %H:%M".to_string(),
        }
    }
}

impl FormattingHints {
    pub fn format_value(&self, value: &Scalar) -> String {
        match value {
            Scalar::Real(v) => format!("{:.*}", self.decimal_places, v),
            Scalar::Date(d) => d.format(&self.date_format).to_string(),
            Scalar::Timestamp(ts) => ts.format(&self.timestamp_format).to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x: Option<String>,
    pub y: Option<String>,
    pub color: Option<String>,
    pub formatting: FormattingHints,
    /// Why a table was chosen when the data did not fit a chart
    pub fallback_reason: Option<String>,
}

impl ChartSpec {
    pub fn table(reason: Option<String>) -> Self {
        Self {
            kind: ChartKind::Table,
            x: None,
            y: None,
            color: None,
            formatting: FormattingHints::default(),
            fallback_reason: reason,
        }
    }

    fn chart(kind: ChartKind, x: &str, y: &str, color: Option<String>) -> Self {
        Self {
            kind,
            x: Some(x.to_string()),
            y: Some(y.to_string()),
            color,
            formatting: FormattingHints {
                x_title: Some(axis_title(x)),
                y_title: Some(axis_title(y)),
                ..FormattingHints::default()
            },
            fallback_reason: None,
        }
    }
}

/// `total_revenue` -> `Total Revenue`
pub fn axis_title(column: &str) -> String {
    column
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[derive(Debug, Default, Clone)]
pub struct VisualizationSelector;

impl VisualizationSelector {
    pub fn new() -> Self {
        Self
    }

    pub fn select(&self, result: &ResultSet, hint: Option<&VisualizationHint>) -> ChartSpec {
        let columns = result.columns();

        if result.is_empty() {
            return ChartSpec::table(Some("no rows to chart".to_string()));
        }
        if result.row_count() == 1 && (1..=2).contains(&columns.len()) {
            return ChartSpec::table(None);
        }

        let numeric = of_type(columns, ColumnType::is_numeric);
        let temporal = of_type(columns, ColumnType::is_temporal);
        let categorical = of_type(columns, ColumnType::is_categorical);

        // The generator's axis suggestions only break ties among columns
        // that already fit the role
        let hinted_x = hint.and_then(|h| h.x.as_deref());
        let hinted_y = hint.and_then(|h| h.y.as_deref());

        if !temporal.is_empty() && !numeric.is_empty() {
            let time = prefer(&temporal, hinted_x);
            let value = prefer(&numeric, hinted_y);
            let color = lowest_cardinality(result, &categorical);
            return ChartSpec::chart(ChartKind::Line, &time.name, &value.name, color);
        }

        if categorical.len() == 1 && !numeric.is_empty() {
            let category = categorical[0];
            let value = prefer(&numeric, hinted_y);
            if result.distinct_count(&category.name) <= MAX_CATEGORIES {
                let wants_pie = hint.and_then(|h| h.chart) == Some(ChartKind::Pie);
                let kind = if wants_pie && all_non_negative(result, &value.name) {
                    ChartKind::Pie
                } else {
                    ChartKind::Bar
                };
                return ChartSpec::chart(kind, &category.name, &value.name, None);
            }
        }

        if numeric.len() == 2 {
            let (mut x, mut y) = (numeric[0], numeric[1]);
            if hinted_x == Some(y.name.as_str()) || hinted_y == Some(x.name.as_str()) {
                std::mem::swap(&mut x, &mut y);
            }
            let color = lowest_cardinality(result, &categorical);
            return ChartSpec::chart(ChartKind::Scatter, &x.name, &y.name, color);
        }

        ChartSpec::table(Some(format!(
            "{} numeric, {} categorical and {} date columns do not map to a chart",
            numeric.len(),
            categorical.len(),
            temporal.len()
        )))
    }
}

fn of_type(columns: &[ResultColumn], predicate: fn(&ColumnType) -> bool) -> Vec<&ResultColumn> {
    columns.iter().filter(|c| predicate(&c.column_type)).collect()
}

/// The candidate named by the hint, else the first one
fn prefer<'c>(candidates: &[&'c ResultColumn], hinted: Option<&str>) -> &'c ResultColumn {
    hinted
        .and_then(|name| candidates.iter().find(|c| c.name == name))
        .copied()
        .unwrap_or(candidates[0])
}

/// Series axis: the categorical column with the fewest distinct values,
/// provided it stays readable
fn lowest_cardinality(result: &ResultSet, candidates: &[&ResultColumn]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (result.distinct_count(&c.name), c))
        .filter(|(count, _)| *count <= MAX_CATEGORIES)
        .min_by_key(|(count, _)| *count)
        .map(|(_, c)| c.name.clone())
}

fn all_non_negative(result: &ResultSet, column: &str) -> bool {
    result
        .column_values(column)
        .iter()
        .all(|v| v.as_f64().map(|n| n >= 0.0).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn col(name: &str, column_type: ColumnType) -> ResultColumn {
        ResultColumn {
            name: name.to_string(),
            column_type,
        }
    }

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.to_string())
    }

    fn revenue_by_region(regions: &[&str]) -> ResultSet {
        ResultSet::new(
            vec![col("region", ColumnType::Text), col("revenue", ColumnType::Real)],
            regions
                .iter()
                .enumerate()
                .map(|(i, r)| vec![text(r), Scalar::Real(100.0 * (i + 1) as f64)])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_date_and_numeric_is_line() {
        let rows = (1..=6)
            .map(|m| {
                vec![
                    Scalar::Date(NaiveDate::from_ymd_opt(2024, m, 1).unwrap()),
                    Scalar::Real(1000.0 + m as f64),
                ]
            })
            .collect();
        let result = ResultSet::new(
            vec![col("date", ColumnType::Date), col("revenue", ColumnType::Real)],
            rows,
        )
        .unwrap();

        let chart = VisualizationSelector::new().select(&result, None);
        assert_eq!(chart.kind, ChartKind::Line);
        assert_eq!(chart.x.as_deref(), Some("date"));
        assert_eq!(chart.y.as_deref(), Some("revenue"));
    }

    #[test]
    fn test_category_and_numeric_is_bar() {
        let result = revenue_by_region(&["North", "South", "East", "West"]);
        let chart = VisualizationSelector::new().select(&result, None);
        assert_eq!(chart.kind, ChartKind::Bar);
        assert_eq!(chart.x.as_deref(), Some("region"));
        assert_eq!(chart.y.as_deref(), Some("revenue"));
        assert_eq!(chart.formatting.y_title.as_deref(), Some("Revenue"));
    }

    #[test]
    fn test_pie_only_when_hinted() {
        let result = revenue_by_region(&["North", "South", "East"]);
        let hint = VisualizationHint {
            chart: Some(ChartKind::Pie),
            ..Default::default()
        };
        let selector = VisualizationSelector::new();
        assert_eq!(selector.select(&result, Some(&hint)).kind, ChartKind::Pie);
        assert_eq!(selector.select(&result, None).kind, ChartKind::Bar);
    }

    #[test]
    fn test_too_many_categories_falls_back_to_table() {
        let names: Vec<String> = (0..13).map(|i| format!("region_{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let chart = VisualizationSelector::new().select(&revenue_by_region(&refs), None);
        assert_eq!(chart.kind, ChartKind::Table);
        assert!(chart.fallback_reason.is_some());
    }

    #[test]
    fn test_single_cell_is_table() {
        let result = ResultSet::new(vec![col("total", ColumnType::Real)], vec![vec![Scalar::Real(42.0)]]).unwrap();
        assert_eq!(VisualizationSelector::new().select(&result, None).kind, ChartKind::Table);
    }

    #[test]
    fn test_two_numeric_is_scatter() {
        let result = ResultSet::new(
            vec![col("price", ColumnType::Real), col("units", ColumnType::Integer)],
            vec![
                vec![Scalar::Real(1.5), Scalar::Integer(10)],
                vec![Scalar::Real(2.5), Scalar::Integer(4)],
            ],
        )
        .unwrap();
        let chart = VisualizationSelector::new().select(&result, None);
        assert_eq!(chart.kind, ChartKind::Scatter);
        assert_eq!(chart.x.as_deref(), Some("price"));
        assert_eq!(chart.y.as_deref(), Some("units"));
    }

    #[test]
    fn test_hinted_axes_break_ties() {
        let rows = (1..=4)
            .map(|m| {
                vec![
                    Scalar::Date(NaiveDate::from_ymd_opt(2024, m, 1).unwrap()),
                    Scalar::Date(NaiveDate::from_ymd_opt(2024, m, 15).unwrap()),
                    Scalar::Real(1000.0 * m as f64),
                    Scalar::Real(400.0 * m as f64),
                ]
            })
            .collect();
        let result = ResultSet::new(
            vec![
                col("created", ColumnType::Date),
                col("closed", ColumnType::Date),
                col("revenue", ColumnType::Real),
                col("cost", ColumnType::Real),
            ],
            rows,
        )
        .unwrap();
        let selector = VisualizationSelector::new();

        let hint = VisualizationHint {
            chart: None,
            x: Some("closed".to_string()),
            y: Some("cost".to_string()),
        };
        let chart = selector.select(&result, Some(&hint));
        assert_eq!(chart.kind, ChartKind::Line);
        assert_eq!(chart.x.as_deref(), Some("closed"));
        assert_eq!(chart.y.as_deref(), Some("cost"));

        // Names that do not fit the role are ignored
        let hint = VisualizationHint {
            chart: None,
            x: Some("revenue".to_string()),
            y: Some("no_such_column".to_string()),
        };
        let chart = selector.select(&result, Some(&hint));
        assert_eq!(chart.x.as_deref(), Some("created"));
        assert_eq!(chart.y.as_deref(), Some("revenue"));
    }

    #[test]
    fn test_hint_orders_scatter_axes() {
        let result = ResultSet::new(
            vec![col("price", ColumnType::Real), col("units", ColumnType::Integer)],
            vec![
                vec![Scalar::Real(1.5), Scalar::Integer(10)],
                vec![Scalar::Real(2.5), Scalar::Integer(4)],
            ],
        )
        .unwrap();
        let hint = VisualizationHint {
            chart: Some(ChartKind::Scatter),
            x: Some("units".to_string()),
            y: Some("price".to_string()),
        };
        let chart = VisualizationSelector::new().select(&result, Some(&hint));
        assert_eq!(chart.kind, ChartKind::Scatter);
        assert_eq!(chart.x.as_deref(), Some("units"));
        assert_eq!(chart.y.as_deref(), Some("price"));
    }

    #[test]
    fn test_hinted_value_column_for_bar() {
        let result = ResultSet::new(
            vec![
                col("region", ColumnType::Text),
                col("revenue", ColumnType::Real),
                col("deals", ColumnType::Integer),
            ],
            vec![
                vec![text("North"), Scalar::Real(10.0), Scalar::Integer(2)],
                vec![text("South"), Scalar::Real(20.0), Scalar::Integer(3)],
            ],
        )
        .unwrap();
        let hint = VisualizationHint {
            y: Some("deals".to_string()),
            ..Default::default()
        };
        let chart = VisualizationSelector::new().select(&result, Some(&hint));
        assert_eq!(chart.kind, ChartKind::Bar);
        assert_eq!(chart.y.as_deref(), Some("deals"));
    }

    #[test]
    fn test_empty_result_is_table() {
        let result = ResultSet::new(vec![col("region", ColumnType::Text)], vec![]).unwrap();
        let chart = VisualizationSelector::new().select(&result, None);
        assert_eq!(chart.kind, ChartKind::Table);
    }

    #[test]
    fn test_formatting() {
        let hints = FormattingHints::default();
        assert_eq!(hints.format_value(&Scalar::Real(3.14159)), "3.14");
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 30, 15)
            .unwrap();
        assert_eq!(hints.format_value(&Scalar::Timestamp(ts)), "2024-03-01 09:30");
        assert_eq!(axis_title("total_revenue"), "Total Revenue");
        assert_eq!(ChartKind::parse(" Pie "), Some(ChartKind::Pie));
    }
}
