//! Column projection: maps server-described columns onto display cells.
//!
//! The server describes each collection's columns as `{ id, name, type }`.
//! Rendering dispatches on a closed [`ColumnKind`] so adding a kind is a
//! compile-time exhaustiveness concern; unrecognized wire types fall back to
//! free text and never error.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::row::Row;

/// Closed set of column renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
  FreeText,
  Number,
  SingleSelect,
  MultiSelect,
  Date,
  Checkbox,
  Location,
  StatusWithReason,
}

impl ColumnKind {
  /// Total mapping from the server's `type` string. Unknown strings are
  /// free text by contract.
  pub fn from_wire(raw: &str) -> Self {
    match raw {
      "number" => Self::Number,
      "singleSelect" | "single_select" => Self::SingleSelect,
      "multiSelect" | "multi_select" => Self::MultiSelect,
      "date" => Self::Date,
      "checkbox" => Self::Checkbox,
      "location" | "address" => Self::Location,
      "statusWithReason" | "status_with_reason" => Self::StatusWithReason,
      _ => Self::FreeText,
    }
  }

  pub fn wire_name(self) -> &'static str {
    match self {
      Self::FreeText => "text",
      Self::Number => "number",
      Self::SingleSelect => "singleSelect",
      Self::MultiSelect => "multiSelect",
      Self::Date => "date",
      Self::Checkbox => "checkbox",
      Self::Location => "location",
      Self::StatusWithReason => "statusWithReason",
    }
  }
}

impl Serialize for ColumnKind {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(self.wire_name())
  }
}

impl<'de> Deserialize<'de> for ColumnKind {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let raw = String::deserialize(deserializer)?;
    Ok(Self::from_wire(&raw))
  }
}

/// One column of a collection as the server describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
  pub id: String,
  pub name: String,
  #[serde(rename = "type")]
  pub kind: ColumnKind,
}

/// One rendered cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
  pub column_id: String,
  pub text: String,
}

/// Project a row through the column list, one cell per column in column
/// order. Missing fields render empty.
pub fn project(columns: &[ColumnSpec], row: &Row) -> Vec<Cell> {
  columns
    .iter()
    .map(|column| Cell {
      column_id: column.id.clone(),
      text: match row.field(&column.id) {
        Some(value) => render(column.kind, value),
        None => String::new(),
      },
    })
    .collect()
}

fn render(kind: ColumnKind, value: &Value) -> String {
  match kind {
    ColumnKind::FreeText | ColumnKind::SingleSelect | ColumnKind::Date => plain(value),
    ColumnKind::Number => match value {
      Value::Number(n) => n.to_string(),
      other => plain(other),
    },
    ColumnKind::Checkbox => {
      if value.as_bool().unwrap_or(false) {
        "Yes".to_string()
      } else {
        "No".to_string()
      }
    }
    ColumnKind::MultiSelect => match value {
      Value::Array(items) => items.iter().map(plain).collect::<Vec<_>>().join(", "),
      other => plain(other),
    },
    ColumnKind::Location => match value {
      Value::Object(parts) => ["street", "city", "state", "zip"]
        .iter()
        .filter_map(|key| parts.get(*key))
        .map(plain)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", "),
      other => plain(other),
    },
    ColumnKind::StatusWithReason => match value {
      Value::Object(parts) => {
        let status = parts.get("status").map(plain).unwrap_or_default();
        match parts.get("reason").map(plain).filter(|r| !r.is_empty()) {
          Some(reason) => format!("{} ({})", status, reason),
          None => status,
        }
      }
      other => plain(other),
    },
  }
}

/// String form of an arbitrary JSON value, without quoting strings.
fn plain(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => String::new(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row_with(fields: &[(&str, Value)]) -> Row {
    let mut map = crate::row::FieldMap::new();
    for (name, value) in fields {
      map.insert(name.to_string(), value.clone());
    }
    Row::new("r1", map)
  }

  #[test]
  fn test_unknown_wire_type_falls_back_to_free_text() {
    assert_eq!(ColumnKind::from_wire("hologram"), ColumnKind::FreeText);
    assert_eq!(ColumnKind::from_wire(""), ColumnKind::FreeText);
  }

  #[test]
  fn test_wire_names_round_trip() {
    for kind in [
      ColumnKind::FreeText,
      ColumnKind::Number,
      ColumnKind::SingleSelect,
      ColumnKind::MultiSelect,
      ColumnKind::Date,
      ColumnKind::Checkbox,
      ColumnKind::Location,
      ColumnKind::StatusWithReason,
    ] {
      assert_eq!(ColumnKind::from_wire(kind.wire_name()), kind);
    }
  }

  #[test]
  fn test_column_spec_deserializes_unknown_types_without_error() {
    let spec: ColumnSpec =
      serde_json::from_value(json!({ "id": "c1", "name": "Notes", "type": "mystery" })).unwrap();
    assert_eq!(spec.kind, ColumnKind::FreeText);
  }

  #[test]
  fn test_projection_renders_each_kind() {
    let columns = vec![
      ColumnSpec {
        id: "name".into(),
        name: "Name".into(),
        kind: ColumnKind::FreeText,
      },
      ColumnSpec {
        id: "visits".into(),
        name: "Visits".into(),
        kind: ColumnKind::Number,
      },
      ColumnSpec {
        id: "active".into(),
        name: "Active".into(),
        kind: ColumnKind::Checkbox,
      },
      ColumnSpec {
        id: "tags".into(),
        name: "Tags".into(),
        kind: ColumnKind::MultiSelect,
      },
      ColumnSpec {
        id: "home".into(),
        name: "Home".into(),
        kind: ColumnKind::Location,
      },
      ColumnSpec {
        id: "state".into(),
        name: "State".into(),
        kind: ColumnKind::StatusWithReason,
      },
    ];
    let row = row_with(&[
      ("name", json!("Ada")),
      ("visits", json!(3)),
      ("active", json!(true)),
      ("tags", json!(["north", "priority"])),
      ("home", json!({ "street": "12 Elm St", "city": "Bend", "state": "OR" })),
      ("state", json!({ "status": "Declined", "reason": "out of network" })),
    ]);

    let cells = project(&columns, &row);
    let texts: Vec<&str> = cells.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(
      texts,
      vec![
        "Ada",
        "3",
        "Yes",
        "north, priority",
        "12 Elm St, Bend, OR",
        "Declined (out of network)",
      ]
    );
  }

  #[test]
  fn test_missing_fields_render_empty() {
    let columns = vec![ColumnSpec {
      id: "phone".into(),
      name: "Phone".into(),
      kind: ColumnKind::FreeText,
    }];
    let cells = project(&columns, &row_with(&[]));
    assert_eq!(cells[0].text, "");
  }

  #[test]
  fn test_status_without_reason_renders_bare() {
    let text = render(
      ColumnKind::StatusWithReason,
      &json!({ "status": "Accepted" }),
    );
    assert_eq!(text, "Accepted");
  }
}
