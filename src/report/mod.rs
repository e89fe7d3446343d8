//! Report catalog: reports, their parameters, and the data connections the
//! external query executor runs them against.

pub mod defaults;
pub mod params;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::domain::ValidationError;

pub use self::defaults::DefaultExpr;
pub use self::params::{resolve_parameters, ReportRequest};

/// A report made up of one or more datasets rendered by the render service.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub id: i64,
    pub title: String,
    pub byline: String,
    pub parameters: Vec<Parameter>,
}

impl Report {
    /// Title usable as a file name.
    pub fn filename(&self) -> String {
        static UNSAFE: OnceLock<Regex> = OnceLock::new();
        UNSAFE
            .get_or_init(|| Regex::new(r"[^a-zA-Z0-9_\-]").expect("static regex"))
            .replace_all(&self.title, "-")
            .into_owned()
    }

    /// Site-relative link to the live report.
    pub fn absolute_path(&self) -> String {
        format!("/reports/{}/", self.id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::Empty { field: "title" });
        }
        self.parameters.iter().try_for_each(Parameter::validate)
    }
}

/// Value type of a report parameter, mirrored by the render service's form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Char,
    Date,
    DateTime,
    Decimal,
    Integer,
    Time,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Boolean => "boolean",
            DataType::Char => "char",
            DataType::Date => "date",
            DataType::DateTime => "datetime",
            DataType::Decimal => "decimal",
            DataType::Integer => "integer",
            DataType::Time => "time",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(DataType::Boolean),
            "char" | "text" => Ok(DataType::Char),
            "date" => Ok(DataType::Date),
            "datetime" => Ok(DataType::DateTime),
            "decimal" => Ok(DataType::Decimal),
            "integer" | "int" => Ok(DataType::Integer),
            "time" => Ok(DataType::Time),
            _ => Err(ValidationError::UnknownVariant {
                kind: "data type",
                value: s.to_string(),
            }),
        }
    }
}

/// An input a report asks for, referenced by name in dataset queries.
#[derive(Debug, Clone, Serialize)]
pub struct Parameter {
    pub id: i64,
    pub name: String,
    pub label: String,
    pub data_type: DataType,
    /// Computed default, see [`DefaultExpr`].
    pub default_expr: Option<String>,
    pub required: bool,
}

impl Parameter {
    pub fn validate(&self) -> Result<(), ValidationError> {
        static IDENT: OnceLock<Regex> = OnceLock::new();
        let ident =
            IDENT.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex"));
        if !ident.is_match(&self.name) {
            return Err(ValidationError::ParameterName {
                name: self.name.clone(),
            });
        }

        if let Some(expr) = self.default_expr.as_deref().filter(|e| !e.trim().is_empty()) {
            if self.required {
                return Err(ValidationError::RequiredWithDefault {
                    name: self.name.clone(),
                });
            }
            expr.parse::<DefaultExpr>()?;
        }
        Ok(())
    }
}

/// Where a dataset's query runs. The password is held in plaintext here and
/// encrypted by the storage layer on the way to disk.
#[derive(Clone)]
pub struct DataConnection {
    pub id: i64,
    pub drivername: String,
    pub dialect: Option<String>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: String,
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("id", &self.id)
            .field("drivername", &self.drivername)
            .field("dialect", &self.dialect)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}

impl DataConnection {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.drivername.trim().is_empty() {
            return Err(ValidationError::Empty { field: "drivername" });
        }
        if self.database.trim().is_empty() {
            return Err(ValidationError::Empty { field: "database" });
        }
        Ok(())
    }

    /// Connection URL in `driver[+dialect]://user:password@host:port/database`
    /// form, handed to the external query executor.
    pub fn url(&self) -> Zeroizing<String> {
        self.format_url(self.password.as_deref().map(String::as_str))
    }

    /// Same as [`DataConnection::url`] with the password masked, for logs.
    pub fn display_url(&self) -> String {
        let masked = self.password.as_ref().map(|_| "***");
        self.format_url(masked).as_str().to_owned()
    }

    fn format_url(&self, password: Option<&str>) -> Zeroizing<String> {
        let enc = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();

        let mut out = Zeroizing::new(self.drivername.clone());
        if let Some(dialect) = self.dialect.as_deref().filter(|d| !d.is_empty()) {
            out.push('+');
            out.push_str(dialect);
        }
        out.push_str("://");

        let user = self.username.as_deref().filter(|u| !u.is_empty());
        if let Some(user) = user {
            out.push_str(&enc(user));
            if let Some(pw) = password.filter(|p| !p.is_empty()) {
                out.push(':');
                out.push_str(&enc(pw));
            }
            out.push('@');
        }
        if let Some(host) = self.host.as_deref() {
            out.push_str(host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out.push('/');
        out.push_str(&self.database);
        out
    }
}
