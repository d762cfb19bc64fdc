//! Role-based access control over the data types exposed by the API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Agent,
    Analyst,
    Viewer,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Admin, Role::Manager, Role::Agent, Role::Analyst, Role::Viewer];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Agent => "agent",
            Role::Analyst => "analyst",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown role: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Property,
    Client,
    Lead,
    Transaction,
    MarketData,
    Financial,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Property => "property",
            DataType::Client => "client",
            DataType::Lead => "lead",
            DataType::Transaction => "transaction",
            DataType::MarketData => "market_data",
            DataType::Financial => "financial",
        }
    }
}

const CONTACT_FIELDS: &[&str] = &[
    "phone",
    "email",
    "contact_phone",
    "contact_email",
    "owner_name",
    "owner_contact",
    "passport_number",
    "emirates_id",
];

const COMMERCIAL_FIELDS: &[&str] = &["commission", "profit_margin", "internal_notes"];

/// Static role policy. Admins and managers see everything they can access.
#[derive(Debug, Clone, Copy, Default)]
pub struct RbacManager;

impl RbacManager {
    pub fn new() -> Self {
        Self
    }

    pub fn allowed_roles(&self, data_type: DataType) -> &'static [Role] {
        use Role::*;
        match data_type {
            DataType::Property | DataType::MarketData => &[Admin, Manager, Agent, Analyst, Viewer],
            DataType::Client | DataType::Lead => &[Admin, Manager, Agent],
            DataType::Transaction => &[Admin, Manager, Agent, Analyst],
            DataType::Financial => &[Admin, Manager, Analyst],
        }
    }

    pub fn can_access(&self, role: Role, data_type: DataType) -> bool {
        self.allowed_roles(data_type).contains(&role)
    }

    pub fn require(&self, role: Role, data_type: DataType) -> Result<()> {
        if self.can_access(role, data_type) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "role '{}' cannot access {} data",
                role,
                data_type.as_str()
            )))
        }
    }

    fn restricted_fields(&self, role: Role) -> Vec<&'static str> {
        match role {
            Role::Admin | Role::Manager => Vec::new(),
            Role::Agent => COMMERCIAL_FIELDS.to_vec(),
            Role::Analyst => CONTACT_FIELDS
                .iter()
                .chain(&["internal_notes"])
                .copied()
                .collect(),
            Role::Viewer => CONTACT_FIELDS.iter().chain(COMMERCIAL_FIELDS).copied().collect(),
        }
    }

    /// Check access, then strip the fields `role` may not see from `value`,
    /// descending through nested objects and arrays.
    pub fn filter_fields(&self, role: Role, data_type: DataType, value: Value) -> Result<Value> {
        self.require(role, data_type)?;
        let restricted = self.restricted_fields(role);
        if restricted.is_empty() {
            return Ok(value);
        }
        Ok(strip(value, &restricted))
    }
}

fn strip(value: Value, restricted: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(k, _)| !restricted.contains(&k.as_str()))
                .map(|(k, v)| (k, strip(v, restricted)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| strip(v, restricted)).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn access_matrix() {
        let rbac = RbacManager::new();
        for role in Role::ALL {
            assert!(rbac.can_access(role, DataType::Property));
        }
        assert!(!rbac.can_access(Role::Viewer, DataType::Client));
        assert!(!rbac.can_access(Role::Agent, DataType::Financial));
        assert!(rbac.can_access(Role::Analyst, DataType::Financial));
        assert!(matches!(
            rbac.require(Role::Viewer, DataType::Lead),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn filters_nested_fields_per_role() {
        let rbac = RbacManager::new();
        let doc = json!({
            "id": "p1",
            "commission": 2.0,
            "owner": {"owner_name": "A", "phone": "050", "area": "JVC"},
            "history": [{"email": "x@y", "price": 1}]
        });

        let agent = rbac.filter_fields(Role::Agent, DataType::Property, doc.clone()).unwrap();
        assert!(agent.get("commission").is_none());
        assert_eq!(agent["owner"]["phone"], "050");

        let viewer = rbac.filter_fields(Role::Viewer, DataType::Property, doc.clone()).unwrap();
        assert!(viewer.get("commission").is_none());
        assert_eq!(viewer["owner"], json!({"area": "JVC"}));
        assert_eq!(viewer["history"][0], json!({"price": 1}));

        let admin = rbac.filter_fields(Role::Admin, DataType::Property, doc.clone()).unwrap();
        assert_eq!(admin, doc);
    }

    #[test]
    fn role_parsing() {
        assert_eq!("Manager".parse::<Role>().unwrap(), Role::Manager);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::Analyst).unwrap(), "\"analyst\"");
    }
}
