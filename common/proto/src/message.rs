use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `error` field value of a successful response.
pub const NO_ERROR: &str = "NoError";

/// Fixed command vocabulary of the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Add,
    AddMany,
    AddNewKey,
    AddSection,
    Auth,
    CreateDb,
    GetAll,
    GetAllBySection,
    GetById,
    GetByQuery,
    UpdateById,
    UpdateByQuery,
    DeleteById,
    DeleteByQuery,
    Purge,
    PurgeAll,
    UseDb,
    UseSection,
    SetIdGenerator,
}

/// One decoded client request: `{cmd, auth, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: Command,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// One server response: `{error, data}`. `error` is `"NoError"` on success,
/// otherwise an error-kind name; `data` carries the command result or the
/// error message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub error: String,
    pub data: Value,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            error: NO_ERROR.to_string(),
            data,
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: kind.to_string(),
            data: Value::String(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == NO_ERROR
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub credentials: String,
    pub encrypt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseDbPayload {
    pub dbname: String,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseSectionPayload {
    pub section: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDbPayload {
    pub dbname: String,
    pub force: bool,
    #[serde(rename = "use")]
    pub use_db: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPayload {
    pub section: String,
    pub data: Map<String, Value>,
    pub ignore_missing_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddManyPayload {
    pub section: String,
    pub data: Vec<Map<String, Value>>,
    pub json_response: bool,
    pub ignore_missing_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNewKeyPayload {
    pub section: String,
    pub key: String,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSectionPayload {
    pub section: String,
    #[serde(rename = "use")]
    pub use_section: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAllBySectionPayload {
    pub section: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetByIdPayload {
    pub section: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetByQueryPayload {
    pub section: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateByIdPayload {
    pub section: String,
    pub id: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateByQueryPayload {
    pub section: String,
    pub query: String,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteByIdPayload {
    pub section: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteByQueryPayload {
    pub section: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgePayload {
    pub section: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetIdGeneratorPayload {
    #[serde(rename = "fn")]
    pub generator: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_names_match_the_wire() {
        let cases = [
            (Command::Add, "ADD"),
            (Command::AddMany, "ADD_MANY"),
            (Command::AddNewKey, "ADD_NEW_KEY"),
            (Command::AddSection, "ADD_SECTION"),
            (Command::Auth, "AUTH"),
            (Command::CreateDb, "CREATE_DB"),
            (Command::GetAll, "GET_ALL"),
            (Command::GetAllBySection, "GET_ALL_BY_SECTION"),
            (Command::GetById, "GET_BY_ID"),
            (Command::GetByQuery, "GET_BY_QUERY"),
            (Command::UpdateById, "UPDATE_BY_ID"),
            (Command::UpdateByQuery, "UPDATE_BY_QUERY"),
            (Command::DeleteById, "DELETE_BY_ID"),
            (Command::DeleteByQuery, "DELETE_BY_QUERY"),
            (Command::Purge, "PURGE"),
            (Command::PurgeAll, "PURGE_ALL"),
            (Command::UseDb, "USE_DB"),
            (Command::UseSection, "USE_SECTION"),
            (Command::SetIdGenerator, "SET_ID_GENERATOR"),
        ];
        for (cmd, wire) in cases {
            assert_eq!(serde_json::to_value(cmd).unwrap(), json!(wire));
        }
    }

    #[test]
    fn request_envelope_decodes() {
        let raw = json!({
            "cmd": "ADD",
            "auth": "session-key",
            "payload": {"section": "people", "data": {"name": "A"}, "ignore_missing_key": false}
        });
        let request: Request = serde_json::from_value(raw).expect("request");
        assert_eq!(request.cmd, Command::Add);
        assert_eq!(request.auth.as_deref(), Some("session-key"));
        let payload: AddPayload = serde_json::from_value(request.payload).expect("payload");
        assert_eq!(payload.section, "people");
        assert!(!payload.ignore_missing_key);
    }

    #[test]
    fn auth_may_be_absent_before_authentication() {
        let raw = json!({"cmd": "AUTH", "payload": {"credentials": "#blob", "encrypt": false}});
        let request: Request = serde_json::from_value(raw).expect("request");
        assert!(request.auth.is_none());
    }

    #[test]
    fn reserved_word_fields_round_trip() {
        let create: CreateDbPayload =
            serde_json::from_value(json!({"dbname": "d1", "force": true, "use": true}))
                .expect("create_db");
        assert!(create.use_db);
        let gen: SetIdGeneratorPayload =
            serde_json::from_value(json!({"fn": "counter"})).expect("set_id_generator");
        assert_eq!(gen.generator, "counter");
    }

    #[test]
    fn success_response_shape() {
        let response = Response::ok(json!({"dbname": "d1"}));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"error": "NoError", "data": {"dbname": "d1"}})
        );
        assert!(response.is_ok());
        assert!(!Response::error("UnknownKeyError", "missing key(s)").is_ok());
    }
}
