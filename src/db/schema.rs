use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    pub tables: Vec<Table>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub statistics: Option<TableStatistics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    #[serde(default)]
    pub constraint_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    pub is_unique: bool,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
}

/// CHECK, UNIQUE and EXCLUSION constraints with their rendered definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub definition: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableStatistics {
    #[serde(default)]
    pub row_count: Option<i64>,
    #[serde(default)]
    pub total_size: Option<String>,
    #[serde(default)]
    pub total_size_bytes: Option<i64>,
    #[serde(default)]
    pub last_vacuum: Option<String>,
    #[serde(default)]
    pub last_analyze: Option<String>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary)
            .map(|c| c.name.as_str())
            .collect()
    }
}

impl DatabaseSchema {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Markdown description of the schema used as LLM context.
    pub fn to_prompt_text(&self) -> String {
        let mut text = String::from("# DATABASE SCHEMA\n\n");

        if self.tables.is_empty() {
            text.push_str("No tables found in the public schema.\n");
            return text;
        }

        for table in &self.tables {
            let _ = write!(text, "### Table: {}", table.name);
            if let Some(rows) = table.statistics.as_ref().and_then(|s| s.row_count) {
                let _ = write!(text, " (~{} rows)", rows);
            }
            text.push_str("\n\n");

            text.push_str("| Column Name | Data Type | Nullable | Key | Default | Description |\n");
            text.push_str("|------------|-----------|----------|-----|---------|-------------|\n");
            for column in &table.columns {
                let _ = writeln!(
                    text,
                    "| {} | {} | {} | {} | {} | {} |",
                    column.name,
                    column.data_type,
                    if column.nullable { "YES" } else { "NO" },
                    if column.is_primary { "PK" } else { "" },
                    column.default.as_deref().unwrap_or(""),
                    column.description.as_deref().unwrap_or("")
                );
            }
            text.push('\n');

            if !table.foreign_keys.is_empty() {
                text.push_str("Foreign keys:\n");
                for fk in &table.foreign_keys {
                    let _ = writeln!(
                        text,
                        "- {}.{} -> {}.{}",
                        table.name, fk.column, fk.referenced_table, fk.referenced_column
                    );
                }
                text.push('\n');
            }

            let secondary: Vec<&Index> = table.indexes.iter().filter(|i| !i.is_primary).collect();
            if !secondary.is_empty() {
                text.push_str("Indexes:\n");
                for index in secondary {
                    let _ = writeln!(
                        text,
                        "- {}{} ({})",
                        index.name,
                        if index.is_unique { " UNIQUE" } else { "" },
                        index.columns.join(", ")
                    );
                }
                text.push('\n');
            }

            if !table.constraints.is_empty() {
                text.push_str("Constraints:\n");
                for constraint in &table.constraints {
                    let _ = writeln!(
                        text,
                        "- {} {}: {}",
                        constraint.kind, constraint.name, constraint.definition
                    );
                }
                text.push('\n');
            }
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_json() -> &'static str {
        r#"[
          {
            "name": "orders",
            "columns": [
              {"name": "id", "type": "int4", "nullable": false, "default": "nextval('orders_id_seq'::regclass)", "isPrimary": true, "description": null},
              {"name": "user_id", "type": "int4", "nullable": false, "default": null, "isPrimary": false, "description": "Buyer"},
              {"name": "total", "type": "numeric", "nullable": true, "default": null, "isPrimary": false, "description": null}
            ],
            "foreignKeys": [
              {"column": "user_id", "referencedTable": "users", "referencedColumn": "id", "constraintName": "orders_user_id_fkey"}
            ],
            "indexes": [
              {"name": "orders_pkey", "columns": ["id"], "isUnique": true, "isPrimary": true, "method": "btree", "definition": "CREATE UNIQUE INDEX orders_pkey ON public.orders USING btree (id)"},
              {"name": "orders_user_idx", "columns": ["user_id"], "isUnique": false, "isPrimary": false, "method": "btree", "definition": null}
            ],
            "constraints": [
              {"name": "orders_total_check", "type": "CHECK", "definition": "CHECK ((total >= (0)::numeric))"}
            ],
            "statistics": {"rowCount": 1200, "totalSize": "128 kB", "totalSizeBytes": 131072, "lastVacuum": null, "lastAnalyze": "2024-05-01T10:00:00+00:00"}
          },
          {
            "name": "users",
            "columns": [
              {"name": "id", "type": "int4", "nullable": false, "default": null, "isPrimary": true, "description": null},
              {"name": "created_at", "type": "timestamptz", "nullable": false, "default": "now()", "isPrimary": false, "description": null}
            ],
            "foreignKeys": [],
            "indexes": [],
            "constraints": [],
            "statistics": {"rowCount": null, "totalSize": "16 kB", "totalSizeBytes": 16384, "lastVacuum": null, "lastAnalyze": null}
          }
        ]"#
    }

    #[test]
    fn deserializes_catalog_document() {
        let tables: Vec<Table> = serde_json::from_str(catalog_json()).unwrap();
        let schema = DatabaseSchema { tables };

        let orders = schema.table("ORDERS").unwrap();
        assert_eq!(orders.primary_key(), vec!["id"]);
        assert_eq!(orders.foreign_keys[0].referenced_table, "users");
        assert_eq!(orders.column("total").unwrap().data_type, "numeric");
        assert_eq!(orders.statistics.as_ref().unwrap().row_count, Some(1200));
        assert_eq!(schema.table_names().collect::<Vec<_>>(), vec!["orders", "users"]);
    }

    #[test]
    fn prompt_text_lists_tables_keys_and_constraints() {
        let tables: Vec<Table> = serde_json::from_str(catalog_json()).unwrap();
        let text = DatabaseSchema { tables }.to_prompt_text();

        assert!(text.contains("### Table: orders (~1200 rows)"));
        assert!(text.contains("| id | int4 | NO | PK |"));
        assert!(text.contains("- orders.user_id -> users.id"));
        assert!(text.contains("orders_user_idx (user_id)"));
        assert!(!text.contains("orders_pkey"));
        assert!(text.contains("CHECK orders_total_check"));
        assert!(text.contains("### Table: users\n"));
    }

    #[test]
    fn empty_schema_renders_placeholder() {
        let text = DatabaseSchema::default().to_prompt_text();
        assert!(text.contains("No tables found"));
    }
}
