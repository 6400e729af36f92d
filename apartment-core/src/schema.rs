use crate::conn::Statement;
use crate::tenant::Tenant;

/// Session statement that points a connection at a tenant's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchemaSwitch {
    /// MySQL-style `USE `tenant``: one database per tenant.
    #[default]
    UseDatabase,
    /// PostgreSQL-style `SET search_path`: one schema per tenant.
    SearchPath,
}

impl SchemaSwitch {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "use" | "use_database" => Some(Self::UseDatabase),
            "search_path" | "set_search_path" => Some(Self::SearchPath),
            _ => None,
        }
    }

    /// Build the switch statement for an already validated tenant.
    ///
    /// The identifier is quoted as well, with embedded quote characters
    /// doubled.
    pub fn statement(&self, tenant: &Tenant) -> Statement {
        match self {
            SchemaSwitch::UseDatabase => {
                Statement::new(format!("USE `{}`", tenant.as_str().replace('`', "``")))
            }
            SchemaSwitch::SearchPath => Statement::new(format!(
                "SET search_path TO \"{}\"",
                tenant.as_str().replace('"', "\"\"")
            )),
        }
    }
}
