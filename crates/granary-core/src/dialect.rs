//! SQL dialect handling shared by the connectors and the warehouse layer.

use arrow::datatypes::DataType;

use crate::error::EtlError;

/// Warehouse and source SQL dialects supported by the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    Mssql,
    Oracle,
    Sqlite,
}

impl Dialect {
    /// Resolve the dialect from a database URL scheme.
    pub fn from_url(url: &str) -> Result<Self, EtlError> {
        let scheme = url.split("://").next().unwrap_or("");
        match scheme {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mssql" | "sqlserver" => Ok(Dialect::Mssql),
            "oracle" => Ok(Dialect::Oracle),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(EtlError::InvalidConfig(format!(
                "unsupported database URL scheme '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Mssql => "mssql",
            Dialect::Oracle => "oracle",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier, escaping the closing delimiter within it.
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            Dialect::Mssql => format!("[{}]", ident.replace(']', "]]")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Qualified `schema.table` name with every part quoted.
    pub fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }

    /// Bind placeholder for the 1-based parameter position.
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", position),
            Dialect::Mssql => format!("@p{}", position),
            Dialect::Oracle => format!(":{}", position),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Map an Arrow column type to the dialect's SQL column type.
    pub fn sql_type(&self, data_type: &DataType) -> &'static str {
        match data_type {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => "BIGINT",
            DataType::Float16 | DataType::Float32 | DataType::Float64 => match self {
                Dialect::Mssql | Dialect::Oracle => "FLOAT",
                _ => "DOUBLE PRECISION",
            },
            DataType::Boolean => match self {
                Dialect::Mssql => "BIT",
                Dialect::Oracle => "NUMBER(1)",
                _ => "BOOLEAN",
            },
            DataType::Date32 | DataType::Date64 => "DATE",
            DataType::Timestamp(_, _) => self.timestamp_type(),
            DataType::Utf8 | DataType::LargeUtf8 => self.text_type(),
            _ => self.text_type(),
        }
    }

    pub fn text_type(&self) -> &'static str {
        match self {
            Dialect::Mssql => "NVARCHAR(MAX)",
            Dialect::Oracle => "CLOB",
            _ => "TEXT",
        }
    }

    pub fn timestamp_type(&self) -> &'static str {
        match self {
            Dialect::Mssql => "DATETIMEOFFSET",
            Dialect::Sqlite => "TIMESTAMP",
            _ => "TIMESTAMP WITH TIME ZONE",
        }
    }

    /// SQL expression for the current time, used for column defaults.
    pub fn now_expr(&self) -> &'static str {
        match self {
            Dialect::Postgres => "now()",
            Dialect::Mssql => "SYSDATETIMEOFFSET()",
            Dialect::Oracle => "SYSTIMESTAMP",
            Dialect::Sqlite => "CURRENT_TIMESTAMP",
        }
    }

    /// Wrap a bound string parameter so it lands in a timestamp column.
    pub fn cast_timestamp(&self, expr: &str) -> String {
        match self {
            Dialect::Sqlite => expr.to_string(),
            _ => format!("CAST({} AS {})", expr, self.timestamp_type()),
        }
    }

    /// Autoincrementing primary-key column definition for audit-style tables.
    pub fn autoincrement_pk(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
            Dialect::Mssql => "BIGINT IDENTITY(1,1) PRIMARY KEY",
            Dialect::Oracle => "NUMBER GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }

    /// Lightweight health-check query.
    pub fn health_check_query(&self) -> &'static str {
        match self {
            Dialect::Oracle => "SELECT 1 FROM dual",
            _ => "SELECT 1",
        }
    }

    /// Apply a row limit to a `SELECT * FROM ...` statement.
    pub fn select_with_limit(&self, body: &str, limit: u64) -> String {
        match self {
            Dialect::Mssql => {
                // TOP must follow SELECT; body starts with "SELECT ".
                body.replacen("SELECT ", &format!("SELECT TOP {} ", limit), 1)
            }
            Dialect::Oracle => format!("{} FETCH FIRST {} ROWS ONLY", body, limit),
            _ => format!("{} LIMIT {}", body, limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_matches_schemes() {
        assert_eq!(Dialect::from_url("postgres://u@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgresql://u@h/db").unwrap(), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mssql://u@h/db").unwrap(), Dialect::Mssql);
        assert_eq!(Dialect::from_url("oracle://u@h/svc").unwrap(), Dialect::Oracle);
        assert_eq!(Dialect::from_url("sqlite::memory:").unwrap(), Dialect::Sqlite);
        assert!(Dialect::from_url("mysql://u@h/db").is_err());
    }

    #[test]
    fn quoting_escapes_closing_delimiter() {
        assert_eq!(Dialect::Postgres.quote_ident("my\"table"), "\"my\"\"table\"");
        assert_eq!(Dialect::Mssql.quote_ident("my]table"), "[my]]table]");
    }

    #[test]
    fn qualified_table_with_and_without_schema() {
        assert_eq!(
            Dialect::Postgres.qualified_table(Some("public"), "events"),
            "\"public\".\"events\""
        );
        assert_eq!(Dialect::Sqlite.qualified_table(None, "events"), "\"events\"");
    }

    #[test]
    fn placeholders_per_dialect() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Mssql.placeholder(3), "@p3");
        assert_eq!(Dialect::Oracle.placeholder(3), ":3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
    }

    #[test]
    fn sql_types_follow_the_mapping_table() {
        assert_eq!(Dialect::Postgres.sql_type(&DataType::Int64), "BIGINT");
        assert_eq!(Dialect::Postgres.sql_type(&DataType::Float64), "DOUBLE PRECISION");
        assert_eq!(Dialect::Mssql.sql_type(&DataType::Float64), "FLOAT");
        assert_eq!(Dialect::Postgres.sql_type(&DataType::Boolean), "BOOLEAN");
        assert_eq!(Dialect::Mssql.sql_type(&DataType::Boolean), "BIT");
        assert_eq!(Dialect::Postgres.sql_type(&DataType::Utf8), "TEXT");
        assert_eq!(Dialect::Mssql.sql_type(&DataType::Utf8), "NVARCHAR(MAX)");
        assert_eq!(Dialect::Sqlite.sql_type(&DataType::Date32), "DATE");
        // Fallback for anything outside the table.
        assert_eq!(Dialect::Postgres.sql_type(&DataType::Binary), "TEXT");
    }

    #[test]
    fn limit_clause_per_dialect() {
        let body = "SELECT * FROM \"t\"";
        assert_eq!(
            Dialect::Postgres.select_with_limit(body, 10),
            "SELECT * FROM \"t\" LIMIT 10"
        );
        assert_eq!(
            Dialect::Mssql.select_with_limit(body, 10),
            "SELECT TOP 10 * FROM \"t\""
        );
        assert_eq!(
            Dialect::Oracle.select_with_limit(body, 10),
            "SELECT * FROM \"t\" FETCH FIRST 10 ROWS ONLY"
        );
    }

    #[test]
    fn oracle_health_check_uses_dual() {
        assert_eq!(Dialect::Oracle.health_check_query(), "SELECT 1 FROM dual");
        assert_eq!(Dialect::Sqlite.health_check_query(), "SELECT 1");
    }
}
