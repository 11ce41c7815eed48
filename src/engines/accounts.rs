//! Database account management.
//!
//! User names and passwords are spliced into DDL because neither MySQL nor
//! PostgreSQL accepts bind parameters in `CREATE USER`/`GRANT`.  Every
//! input therefore passes [`AccountInput`] validation first.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use garde::Validate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::manager::{AccountAdmin, DbFuture};
use super::sql::SqlClient;
use super::status_row::StatusRow;
use crate::errors::DbError;

// -- Types --------------------------------------------------------------------

/// Privilege tier granted to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Superuser,
    ReadWrite,
    ReadOnly,
    Customized,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Superuser => "superuser",
            RoleType::ReadWrite => "readwrite",
            RoleType::ReadOnly => "readonly",
            RoleType::Customized => "customized",
        }
    }

    /// Ordering weight; higher means more privilege.
    pub fn weight(&self) -> u8 {
        match self {
            RoleType::Superuser => 1 << 3,
            RoleType::ReadWrite => 1 << 2,
            RoleType::ReadOnly => 1 << 1,
            RoleType::Customized => 1,
        }
    }
}

impl FromStr for RoleType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "superuser" => Ok(RoleType::Superuser),
            "readwrite" => Ok(RoleType::ReadWrite),
            "readonly" => Ok(RoleType::ReadOnly),
            "customized" => Ok(RoleType::Customized),
            other => Err(DbError::config(format!("invalid role type: {other}"))),
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "roleName", skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<String>,
}

/// Validated account-management input.
#[derive(Debug, Validate)]
pub struct AccountInput<'a> {
    #[garde(length(min = 1, max = 63), pattern(r"^[A-Za-z_][A-Za-z0-9_\-]*$"))]
    pub user_name: &'a str,
    #[garde(length(max = 128))]
    pub password: &'a str,
}

impl<'a> AccountInput<'a> {
    pub fn checked(user_name: &'a str, password: &'a str) -> Result<Self, DbError> {
        let input = Self {
            user_name,
            password,
        };
        input
            .validate()
            .map_err(|e| DbError::config(format!("invalid account input: {e}")))?;
        Ok(input)
    }
}

fn quote_literal(raw: &str) -> String {
    raw.replace('\'', "''")
}

// -- SQL dialects -------------------------------------------------------------

/// Statement templates for one SQL engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountDialect {
    MySql,
    Postgres,
}

impl AccountDialect {
    fn list_users(&self) -> &'static str {
        match self {
            AccountDialect::MySql => {
                "SELECT user AS userName, CAST(password_expired AS CHAR) AS expired \
                 FROM mysql.user WHERE host = '%' AND user NOT LIKE 'kb%' \
                 AND user NOT IN ('root', 'mysql.sys', 'mysql.session', 'mysql.infoschema')"
            }
            AccountDialect::Postgres => {
                "SELECT usename AS \"userName\", valuntil::text AS expired \
                 FROM pg_catalog.pg_user \
                 WHERE usename NOT LIKE 'kb%' AND usename NOT IN ('postgres') \
                 ORDER BY usename"
            }
        }
    }

    fn list_system_accounts(&self) -> &'static str {
        match self {
            AccountDialect::MySql => {
                "SELECT user AS userName FROM mysql.user \
                 WHERE user LIKE 'kb%' OR user = 'root'"
            }
            AccountDialect::Postgres => {
                "SELECT usename AS \"userName\" FROM pg_catalog.pg_user \
                 WHERE usename LIKE 'kb%' OR usename = 'postgres'"
            }
        }
    }

    fn describe_user(&self, user: &str) -> String {
        match self {
            AccountDialect::MySql => format!(
                "SELECT user AS userName, CAST(password_expired AS CHAR) AS expired, \
                 CAST(Super_priv AS CHAR) AS super_priv, CAST(Insert_priv AS CHAR) AS insert_priv, \
                 CAST(Select_priv AS CHAR) AS select_priv \
                 FROM mysql.user WHERE user = '{}'",
                quote_literal(user)
            ),
            AccountDialect::Postgres => format!(
                "SELECT r.rolname AS \"userName\", r.rolsuper::text AS super_priv, \
                 has_database_privilege(r.rolname, current_database(), 'CREATE')::text AS insert_priv, \
                 has_database_privilege(r.rolname, current_database(), 'CONNECT')::text AS select_priv, \
                 r.rolvaliduntil::text AS expired \
                 FROM pg_catalog.pg_roles r WHERE r.rolname = '{}'",
                quote_literal(user)
            ),
        }
    }

    fn create_user(&self, user: &str, password: &str) -> String {
        match self {
            AccountDialect::MySql => format!(
                "CREATE USER '{}'@'%' IDENTIFIED BY '{}';",
                user,
                quote_literal(password)
            ),
            AccountDialect::Postgres => format!(
                "CREATE USER \"{}\" WITH PASSWORD '{}';",
                user,
                quote_literal(password)
            ),
        }
    }

    fn delete_user(&self, user: &str) -> String {
        match self {
            AccountDialect::MySql => format!("DROP USER IF EXISTS '{user}'@'%';"),
            AccountDialect::Postgres => format!("DROP USER IF EXISTS \"{user}\";"),
        }
    }

    fn grant(&self, user: &str, role: RoleType) -> Result<String, DbError> {
        let sql = match (self, role) {
            (AccountDialect::MySql, RoleType::Superuser) => {
                format!("GRANT ALL PRIVILEGES ON *.* TO '{user}'@'%' WITH GRANT OPTION;")
            }
            (AccountDialect::MySql, RoleType::ReadWrite) => format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, ALTER, INDEX ON *.* TO '{user}'@'%';"
            ),
            (AccountDialect::MySql, RoleType::ReadOnly) => {
                format!("GRANT SELECT, SHOW VIEW ON *.* TO '{user}'@'%';")
            }
            (AccountDialect::Postgres, RoleType::Superuser) => {
                format!("ALTER USER \"{user}\" WITH SUPERUSER;")
            }
            (AccountDialect::Postgres, RoleType::ReadWrite) => {
                format!("GRANT pg_write_all_data, pg_read_all_data TO \"{user}\";")
            }
            (AccountDialect::Postgres, RoleType::ReadOnly) => {
                format!("GRANT pg_read_all_data TO \"{user}\";")
            }
            (_, RoleType::Customized) => {
                return Err(DbError::config("customized roles cannot be granted directly"))
            }
        };
        Ok(sql)
    }

    fn revoke(&self, user: &str, role: RoleType) -> Result<String, DbError> {
        let sql = match (self, role) {
            (AccountDialect::MySql, RoleType::Superuser) => {
                format!("REVOKE ALL PRIVILEGES, GRANT OPTION FROM '{user}'@'%';")
            }
            (AccountDialect::MySql, RoleType::ReadWrite) => format!(
                "REVOKE SELECT, INSERT, UPDATE, DELETE, CREATE, DROP, ALTER, INDEX ON *.* FROM '{user}'@'%';"
            ),
            (AccountDialect::MySql, RoleType::ReadOnly) => {
                format!("REVOKE SELECT, SHOW VIEW ON *.* FROM '{user}'@'%';")
            }
            (AccountDialect::Postgres, RoleType::Superuser) => {
                format!("ALTER USER \"{user}\" WITH NOSUPERUSER;")
            }
            (AccountDialect::Postgres, RoleType::ReadWrite) => {
                format!("REVOKE pg_write_all_data, pg_read_all_data FROM \"{user}\";")
            }
            (AccountDialect::Postgres, RoleType::ReadOnly) => {
                format!("REVOKE pg_read_all_data FROM \"{user}\";")
            }
            (_, RoleType::Customized) => {
                return Err(DbError::config("customized roles cannot be revoked directly"))
            }
        };
        Ok(sql)
    }
}

/// Derive the role tier from the privilege columns of a describe row.
fn infer_role(row: &StatusRow) -> RoleType {
    let yes = |col: &str| {
        let v = row.get_string(col);
        v.eq_ignore_ascii_case("y") || super::status_row::parse_bool(v)
    };
    if yes("super_priv") {
        RoleType::Superuser
    } else if yes("insert_priv") {
        RoleType::ReadWrite
    } else if yes("select_priv") {
        RoleType::ReadOnly
    } else {
        RoleType::Customized
    }
}

fn user_from_row(row: &StatusRow) -> UserInfo {
    let expired = row.get_string("expired");
    UserInfo {
        user_name: row.get_string("userName").to_string(),
        role_name: None,
        expired: (!expired.is_empty()).then(|| expired.to_string()),
    }
}

// -- SQL-backed admin ---------------------------------------------------------

/// [`AccountAdmin`] over a [`SqlClient`] with the given dialect.
pub struct SqlAccounts {
    dialect: AccountDialect,
    client: Arc<dyn SqlClient>,
}

impl SqlAccounts {
    pub fn new(dialect: AccountDialect, client: Arc<dyn SqlClient>) -> Self {
        Self { dialect, client }
    }
}

impl AccountAdmin for SqlAccounts {
    fn list_users(&self) -> DbFuture<'_, Vec<UserInfo>> {
        Box::pin(async move {
            let rows = self.client.query_rows(self.dialect.list_users()).await?;
            Ok(rows.iter().map(user_from_row).collect())
        })
    }

    fn list_system_accounts(&self) -> DbFuture<'_, Vec<UserInfo>> {
        Box::pin(async move {
            let rows = self
                .client
                .query_rows(self.dialect.list_system_accounts())
                .await?;
            Ok(rows.iter().map(user_from_row).collect())
        })
    }

    fn describe_user<'a>(&'a self, user: &'a str) -> DbFuture<'a, Option<UserInfo>> {
        Box::pin(async move {
            let input = AccountInput::checked(user, "")?;
            let rows = self
                .client
                .query_rows(&self.dialect.describe_user(input.user_name))
                .await?;
            Ok(rows.first().map(|row| UserInfo {
                role_name: Some(infer_role(row).as_str().to_string()),
                ..user_from_row(row)
            }))
        })
    }

    fn create_user<'a>(&'a self, user: &'a str, password: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let input = AccountInput::checked(user, password)?;
            self.client
                .exec(&self.dialect.create_user(input.user_name, input.password))
                .await?;
            info!("Created user {}", input.user_name);
            Ok(())
        })
    }

    fn delete_user<'a>(&'a self, user: &'a str) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let input = AccountInput::checked(user, "")?;
            self.client
                .exec(&self.dialect.delete_user(input.user_name))
                .await?;
            info!("Deleted user {}", input.user_name);
            Ok(())
        })
    }

    fn grant_user_role<'a>(&'a self, user: &'a str, role: RoleType) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let input = AccountInput::checked(user, "")?;
            let sql = self.dialect.grant(input.user_name, role)?;
            self.client.exec(&sql).await?;
            info!("Granted {} to {}", role, input.user_name);
            Ok(())
        })
    }

    fn revoke_user_role<'a>(&'a self, user: &'a str, role: RoleType) -> DbFuture<'a, ()> {
        Box::pin(async move {
            let input = AccountInput::checked(user, "")?;
            let sql = self.dialect.revoke(input.user_name, role)?;
            self.client.exec(&sql).await?;
            info!("Revoked {} from {}", role, input.user_name);
            Ok(())
        })
    }
}
