use crate::db::schema::{DatabaseSchema, Table};
use crate::db::DbError;
use postgres::Client;
use tracing::{debug, info};

/// One round trip over `information_schema` and `pg_catalog` that returns
/// every base table in `public` as a single JSON document.
pub const SCHEMA_QUERY: &str = r#"
WITH base_tables AS (
    SELECT c.oid, c.relname AS table_name
    FROM pg_catalog.pg_class c
    JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
    JOIN information_schema.tables t
      ON t.table_schema = n.nspname AND t.table_name = c.relname
    WHERE n.nspname = 'public' AND t.table_type = 'BASE TABLE'
),
table_columns AS (
    SELECT col.table_name,
           json_agg(json_build_object(
               'name', col.column_name,
               'type', col.udt_name,
               'nullable', col.is_nullable = 'YES',
               'default', col.column_default,
               'description', pgd.description,
               'isPrimary', EXISTS (
                   SELECT 1
                   FROM information_schema.table_constraints tc
                   JOIN information_schema.key_column_usage kcu
                     ON kcu.constraint_name = tc.constraint_name
                    AND kcu.table_schema = tc.table_schema
                    AND kcu.table_name = tc.table_name
                   WHERE tc.constraint_type = 'PRIMARY KEY'
                     AND tc.table_schema = col.table_schema
                     AND tc.table_name = col.table_name
                     AND kcu.column_name = col.column_name
               )
           ) ORDER BY col.ordinal_position) AS columns
    FROM information_schema.columns col
    JOIN base_tables bt ON bt.table_name = col.table_name
    LEFT JOIN pg_catalog.pg_description pgd
      ON pgd.objoid = bt.oid AND pgd.objsubid = col.ordinal_position
    WHERE col.table_schema = 'public'
    GROUP BY col.table_name
),
table_foreign_keys AS (
    SELECT tc.table_name,
           json_agg(json_build_object(
               'column', kcu.column_name,
               'referencedTable', ccu.table_name,
               'referencedColumn', ccu.column_name,
               'constraintName', tc.constraint_name
           )) AS foreign_keys
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON kcu.constraint_name = tc.constraint_name
     AND kcu.table_schema = tc.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name
     AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'
    GROUP BY tc.table_name
),
table_indexes AS (
    SELECT bt.table_name,
           json_agg(json_build_object(
               'name', ic.relname,
               'columns', COALESCE((
                   SELECT json_agg(a.attname ORDER BY k.ord)
                   FROM unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
                   JOIN pg_catalog.pg_attribute a
                     ON a.attrelid = bt.oid AND a.attnum = k.attnum
               ), '[]'::json),
               'isUnique', ix.indisunique,
               'isPrimary', ix.indisprimary,
               'method', am.amname,
               'definition', pg_catalog.pg_get_indexdef(ix.indexrelid)
           ) ORDER BY ic.relname) AS indexes
    FROM base_tables bt
    JOIN pg_catalog.pg_index ix ON ix.indrelid = bt.oid
    JOIN pg_catalog.pg_class ic ON ic.oid = ix.indexrelid
    JOIN pg_catalog.pg_am am ON am.oid = ic.relam
    GROUP BY bt.table_name
),
table_constraints AS (
    SELECT bt.table_name,
           json_agg(json_build_object(
               'name', con.conname,
               'type', CASE con.contype
                           WHEN 'c' THEN 'CHECK'
                           WHEN 'u' THEN 'UNIQUE'
                           ELSE 'EXCLUSION'
                       END,
               'definition', pg_catalog.pg_get_constraintdef(con.oid)
           ) ORDER BY con.conname) AS constraints
    FROM base_tables bt
    JOIN pg_catalog.pg_constraint con ON con.conrelid = bt.oid
    WHERE con.contype IN ('c', 'u', 'x')
    GROUP BY bt.table_name
),
table_statistics AS (
    SELECT bt.table_name,
           json_build_object(
               'rowCount', s.n_live_tup,
               'totalSize', pg_catalog.pg_size_pretty(pg_catalog.pg_total_relation_size(bt.oid)),
               'totalSizeBytes', pg_catalog.pg_total_relation_size(bt.oid),
               'lastVacuum', GREATEST(s.last_vacuum, s.last_autovacuum),
               'lastAnalyze', GREATEST(s.last_analyze, s.last_autoanalyze)
           ) AS statistics
    FROM base_tables bt
    LEFT JOIN pg_catalog.pg_stat_user_tables s ON s.relid = bt.oid
)
SELECT COALESCE(json_agg(json_build_object(
           'name', bt.table_name,
           'columns', COALESCE(c.columns, '[]'::json),
           'foreignKeys', COALESCE(fk.foreign_keys, '[]'::json),
           'indexes', COALESCE(i.indexes, '[]'::json),
           'constraints', COALESCE(con.constraints, '[]'::json),
           'statistics', st.statistics
       ) ORDER BY bt.table_name), '[]'::json)::text AS tables
FROM base_tables bt
LEFT JOIN table_columns c ON c.table_name = bt.table_name
LEFT JOIN table_foreign_keys fk ON fk.table_name = bt.table_name
LEFT JOIN table_indexes i ON i.table_name = bt.table_name
LEFT JOIN table_constraints con ON con.table_name = bt.table_name
LEFT JOIN table_statistics st ON st.table_name = bt.table_name
"#;

/// Reads the schema of the `public` namespace.
///
/// A database without base tables yields an empty schema rather than an error.
pub fn introspect_schema(client: &mut Client) -> Result<DatabaseSchema, DbError> {
    debug!("Running catalog introspection query");
    let row = client.query_one(SCHEMA_QUERY, &[])?;
    let document: Option<String> = row.try_get("tables")?;
    let schema = parse_catalog_document(document.as_deref().unwrap_or("[]"))?;
    info!("Introspected {} tables", schema.tables.len());
    Ok(schema)
}

pub fn parse_catalog_document(document: &str) -> Result<DatabaseSchema, DbError> {
    let tables: Vec<Table> =
        serde_json::from_str(document).map_err(|e| DbError::Catalog(e.to_string()))?;
    Ok(DatabaseSchema { tables })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_an_empty_schema() {
        let schema = parse_catalog_document("[]").unwrap();
        assert!(schema.is_empty());
    }

    #[test]
    fn malformed_document_is_a_catalog_error() {
        let err = parse_catalog_document("{\"not\": \"a list\"}").unwrap_err();
        assert!(matches!(err, DbError::Catalog(_)));
    }

    #[test]
    fn query_covers_every_catalog_section() {
        for needle in [
            "information_schema.columns",
            "pg_description",
            "EXISTS",
            "FOREIGN KEY",
            "pg_index",
            "pg_am",
            "pg_get_constraintdef",
            "pg_stat_user_tables",
            "pg_total_relation_size",
            "'BASE TABLE'",
        ] {
            assert!(SCHEMA_QUERY.contains(needle), "missing {needle}");
        }
    }
}
