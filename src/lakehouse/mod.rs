pub mod tds;

use serde_json::Value;

use crate::error::AppResult;

pub use tds::TdsLakehouse;

/// One result row with its columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    pub fn new(cells: Vec<(String, Value)>) -> Self {
        Self { cells }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Value of the column rendered as text, if present and non-empty.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(value_text)
    }

    pub fn first(&self) -> Option<&Value> {
        self.cells.first().map(|(_, value)| value)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Renders scalar JSON as text; null and blank strings yield `None`.
pub fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

#[async_trait::async_trait]
pub trait LakehouseSource: Send + Sync {
    async fn query(&self, sql: &str) -> AppResult<Vec<Row>>;
}

/// First-column values of each row. Null, empty, zero and `false` cells are
/// skipped; strings are kept exactly as stored.
pub fn area_list(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.first().and_then(area_value))
        .collect()
}

fn area_value(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.as_f64() == Some(0.0) => None,
        other => value_text(other),
    }
}

#[tracing::instrument(name = "lakehouse.fetch_areas", skip(source, sql), fields(areas.count))]
pub async fn fetch_areas(source: &dyn LakehouseSource, sql: &str) -> AppResult<Vec<String>> {
    let rows = source.query(sql).await.inspect_err(|e| {
        tracing::error!(error = %e, "Failed to get areas list");
    })?;
    let areas = area_list(&rows);

    tracing::Span::current().record("areas.count", areas.len());
    tracing::info!(count = areas.len(), "Retrieved areas");
    Ok(areas)
}

/// Employee rows; a failing query is logged and yields no employees.
#[tracing::instrument(
    name = "lakehouse.fetch_employees",
    skip(source, sql),
    fields(employees.count)
)]
pub async fn fetch_employees(source: &dyn LakehouseSource, sql: &str) -> Vec<EmployeeRecord> {
    let rows = match source.query(sql).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "Error querying employee data");
            return Vec::new();
        }
    };

    let employees: Vec<EmployeeRecord> = rows.iter().map(EmployeeRecord::from_row).collect();

    tracing::Span::current().record("employees.count", employees.len());
    tracing::info!(count = employees.len(), "Retrieved employee records");
    employees
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Used in the report parameter and in the SharePoint file and folder names.
    pub identifier: String,
}

impl EmployeeRecord {
    pub fn from_row(row: &Row) -> Self {
        let first_of = |columns: &[&str]| columns.iter().find_map(|c| row.text(c));

        let id = first_of(&["EmployeeID", "ID", "id"])
            .or_else(|| {
                row.cells()
                    .filter_map(|(_, value)| value_text(value))
                    .find(|text| text.chars().all(|c| c.is_ascii_digit()))
            })
            .unwrap_or_else(|| "UnknownID".to_string());

        let name = first_of(&["EmployeeName", "Name", "name"])
            .unwrap_or_else(|| "UnknownName".to_string());
        let email = first_of(&["EmployeeEmail", "Email", "email"]).unwrap_or_default();
        let identifier = row.text("Name").unwrap_or_else(|| name.clone());

        Self {
            id,
            name,
            email,
            identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use serde_json::json;

    fn row(cells: &[(&str, Value)]) -> Row {
        Row::new(
            cells
                .iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        )
    }

    struct FakeLakehouse {
        rows: Option<Vec<Row>>,
    }

    #[async_trait::async_trait]
    impl LakehouseSource for FakeLakehouse {
        async fn query(&self, _sql: &str) -> AppResult<Vec<Row>> {
            self.rows
                .clone()
                .ok_or_else(|| AppError::Lakehouse("login failed".into()))
        }
    }

    #[test]
    fn test_area_list_uses_first_column_and_skips_blanks() {
        let rows = vec![
            row(&[("AreaName", json!("North")), ("Other", json!(1))]),
            row(&[("AreaName", Value::Null)]),
            row(&[("AreaName", json!(""))]),
            row(&[("AreaName", json!(42))]),
            row(&[]),
        ];
        assert_eq!(area_list(&rows), vec!["North", "42"]);
    }

    #[test]
    fn test_area_list_keeps_strings_verbatim_and_drops_falsy_values() {
        let rows = vec![
            row(&[("AreaName", json!(" South West "))]),
            row(&[("AreaName", json!(0))]),
            row(&[("AreaName", json!(0.0))]),
            row(&[("AreaName", json!(false))]),
        ];
        assert_eq!(area_list(&rows), vec![" South West "]);
    }

    #[test]
    fn test_employee_standard_columns() {
        let record = EmployeeRecord::from_row(&row(&[
            ("EmployeeID", json!("00123")),
            ("Name", json!("jdoe")),
            ("EmployeeName", json!("John Doe")),
            ("EmployeeEmail", json!("john@example.com")),
        ]));
        assert_eq!(record.id, "00123");
        assert_eq!(record.name, "John Doe");
        assert_eq!(record.email, "john@example.com");
        assert_eq!(record.identifier, "jdoe");
    }

    #[test]
    fn test_employee_falls_back_to_first_numeric_value() {
        let record = EmployeeRecord::from_row(&row(&[
            ("Label", json!("x")),
            ("StaffNumber", json!(98765)),
            ("name", json!("Jane")),
        ]));
        assert_eq!(record.id, "98765");
        assert_eq!(record.name, "Jane");
        assert_eq!(record.email, "");
        assert_eq!(record.identifier, "Jane");
    }

    #[test]
    fn test_employee_unknowns() {
        let record = EmployeeRecord::from_row(&row(&[("Other", json!("abc"))]));
        assert_eq!(record.id, "UnknownID");
        assert_eq!(record.name, "UnknownName");
        assert_eq!(record.identifier, "UnknownName");
    }

    #[tokio::test]
    async fn test_fetch_areas_propagates_errors() {
        let source = FakeLakehouse { rows: None };
        assert!(fetch_areas(&source, "SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_employees_swallows_errors() {
        let source = FakeLakehouse { rows: None };
        assert!(fetch_employees(&source, "SELECT 1").await.is_empty());

        let source = FakeLakehouse {
            rows: Some(vec![row(&[("ID", json!(7)), ("Name", json!("Ann"))])]),
        };
        let employees = fetch_employees(&source, "SELECT 1").await;
        assert_eq!(employees.len(), 1);
        assert_eq!(employees[0].id, "7");
    }
}
