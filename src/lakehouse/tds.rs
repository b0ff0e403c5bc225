use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde_json::Value;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{LakehouseSource, Row};
use crate::auth::TokenProvider;
use crate::error::{AppError, AppResult};

const DEFAULT_PORT: u16 = 1433;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type TdsClient = Client<Compat<TcpStream>>;

/// Fabric SQL analytics endpoint reached over TDS with an Azure AD token.
pub struct TdsLakehouse {
    host: String,
    port: u16,
    database: String,
    tokens: TokenProvider,
}

impl TdsLakehouse {
    pub fn new(endpoint: &str, database: &str, tokens: TokenProvider) -> Self {
        let (host, port) = parse_endpoint(endpoint);
        Self {
            host,
            port,
            database: database.to_string(),
            tokens,
        }
    }

    #[tracing::instrument(
        name = "lakehouse.connect",
        skip(self),
        fields(db.server = %self.host, db.name = %self.database)
    )]
    async fn connect(&self) -> AppResult<TdsClient> {
        tracing::info!(endpoint = %self.host, "Authenticating with Azure AD for SQL endpoint");
        let token = self.tokens.access_token().await?;

        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.application_name(env!("CARGO_PKG_NAME"));
        config.authentication(AuthMethod::aad_token(token));
        config.encryption(EncryptionLevel::Required);

        let client = open(config).await?;

        tracing::info!("Successfully connected to SQL endpoint");
        Ok(client)
    }
}

async fn open(mut config: Config) -> AppResult<TdsClient> {
    let tcp = connect_tcp(&config).await?;
    match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => Ok(client),
        Err(tiberius::error::Error::Routing { host, port }) => {
            tracing::info!(%host, port, "SQL endpoint redirected connection");
            config.host(&host);
            config.port(port);
            let tcp = connect_tcp(&config).await?;
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| AppError::Lakehouse(format!("failed to connect: {e}")))
        }
        Err(e) => Err(AppError::Lakehouse(format!("failed to connect: {e}"))),
    }
}

async fn connect_tcp(config: &Config) -> AppResult<TcpStream> {
    let addr = config.get_addr();
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| AppError::Lakehouse(format!("connection to {addr} timed out")))??;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

#[async_trait::async_trait]
impl LakehouseSource for TdsLakehouse {
    #[tracing::instrument(
        name = "lakehouse.query",
        skip(self, sql),
        fields(db.statement = %sql, db.rows)
    )]
    async fn query(&self, sql: &str) -> AppResult<Vec<Row>> {
        let mut client = self.connect().await?;

        tracing::info!(query = %sql, "Executing query");
        let rows = client
            .simple_query(sql)
            .await
            .map_err(|e| AppError::Lakehouse(format!("failed to execute query: {e}")))?
            .into_first_result()
            .await
            .map_err(|e| AppError::Lakehouse(format!("failed to read results: {e}")))?;

        let rows: Vec<Row> = rows.into_iter().map(convert_row).collect();

        if let Err(e) = client.close().await {
            tracing::warn!(error = %e, "Failed to close SQL connection cleanly");
        }

        tracing::Span::current().record("db.rows", rows.len());
        tracing::info!(rows = rows.len(), "Query executed successfully");
        Ok(rows)
    }
}

/// Splits `tcp:host,port` (both decorations optional) into host and port.
fn parse_endpoint(endpoint: &str) -> (String, u16) {
    let trimmed = endpoint.trim();
    let trimmed = trimmed.strip_prefix("tcp:").unwrap_or(trimmed);
    match trimmed.rsplit_once(',') {
        Some((host, port)) => (
            host.trim().to_string(),
            port.trim().parse().unwrap_or(DEFAULT_PORT),
        ),
        None => (trimmed.to_string(), DEFAULT_PORT),
    }
}

fn convert_row(row: tiberius::Row) -> Row {
    let names: Vec<String> = row
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    let values = row.into_iter().map(|data| column_value(&data));
    Row::new(names.into_iter().zip(values).collect())
}

fn column_value(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v.map(numeric_value).unwrap_or(Value::Null),
        ColumnData::Date(_) => temporal::<NaiveDate>(data),
        ColumnData::Time(_) => temporal::<NaiveTime>(data),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<NaiveDateTime>(data)
        }
        ColumnData::DateTimeOffset(_) => temporal::<DateTime<FixedOffset>>(data),
        other => Value::String(format!("{other:?}")),
    }
}

/// Integers stay numbers; scaled values keep their exact digits as text.
fn numeric_value(n: Numeric) -> Value {
    let value = n.value();
    let scale = u32::from(n.scale());
    if scale == 0 {
        return i64::try_from(value)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(value.to_string()));
    }

    let divisor = 10u128.pow(scale);
    let abs = value.unsigned_abs();
    let sign = if value < 0 { "-" } else { "" };
    Value::String(format!(
        "{sign}{}.{:0width$}",
        abs / divisor,
        abs % divisor,
        width = scale as usize
    ))
}

fn temporal<'a, T>(data: &'a ColumnData<'static>) -> Value
where
    T: FromSql<'a> + ToString,
{
    match T::from_sql(data) {
        Ok(Some(value)) => Value::String(value.to_string()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lakehouse::{EmployeeRecord, value_text};
    use std::borrow::Cow;

    #[test]
    fn test_parse_endpoint_variants() {
        assert_eq!(
            parse_endpoint("abc.datawarehouse.fabric.microsoft.com"),
            ("abc.datawarehouse.fabric.microsoft.com".to_string(), 1433)
        );
        assert_eq!(
            parse_endpoint("tcp:abc.example.com,1444"),
            ("abc.example.com".to_string(), 1444)
        );
        assert_eq!(
            parse_endpoint(" abc.example.com , nope "),
            ("abc.example.com".to_string(), 1433)
        );
    }

    #[test]
    fn test_column_values() {
        assert_eq!(column_value(&ColumnData::I32(Some(7))), Value::from(7));
        assert_eq!(column_value(&ColumnData::I64(None)), Value::Null);
        assert_eq!(column_value(&ColumnData::Bit(Some(true))), Value::from(true));
        assert_eq!(
            column_value(&ColumnData::String(Some(Cow::Borrowed("North")))),
            Value::from("North")
        );
        assert_eq!(column_value(&ColumnData::String(None)), Value::Null);
    }

    #[test]
    fn test_decimal_values_keep_their_digits() {
        let text = |value: i128, scale: u8| {
            value_text(&column_value(&ColumnData::Numeric(Some(
                Numeric::new_with_scale(value, scale),
            ))))
        };
        assert_eq!(text(123, 0), Some("123".to_string()));
        assert_eq!(text(150, 2), Some("1.50".to_string()));
        assert_eq!(text(-5, 2), Some("-0.05".to_string()));
        assert_eq!(
            column_value(&ColumnData::Numeric(Some(Numeric::new_with_scale(123, 0)))),
            Value::from(123)
        );
    }

    #[test]
    fn test_decimal_employee_id_matches_numeric_fallback() {
        let row = Row::new(vec![
            ("Label".to_string(), Value::from("x")),
            (
                "StaffNumber".to_string(),
                column_value(&ColumnData::Numeric(Some(Numeric::new_with_scale(98765, 0)))),
            ),
        ]);
        assert_eq!(EmployeeRecord::from_row(&row).id, "98765");
    }
}
