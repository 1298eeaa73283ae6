use thiserror::Error;

use common_proto::Response;

/// Domain errors of the document store. Every variant carries the
/// human-readable message reported in the `data` field of an error response;
/// [`DbError::kind`] is the wire name reported in the `error` field.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0}")]
    MissingConfig(String),
    #[error("{0}")]
    InvalidUser(String),
    #[error("{0}")]
    AuthIntegrity(String),
    #[error("{0}")]
    DatabaseNotFound(String),
    #[error("{0}")]
    DatabaseAlreadyExists(String),
    #[error("{0}")]
    SectionNotFound(String),
    #[error("{0}")]
    SectionAlreadyExists(String),
    #[error("{0}")]
    IdDoesNotExist(String),
    #[error("{0}")]
    UnknownKey(String),
    #[error("{0}")]
    SchemaType(String),
    #[error("{0}")]
    MalformedQuery(String),
    #[error("{0}")]
    MalformedIdGenerator(String),
    #[error("{0}")]
    BadType(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Wire name of this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::MissingConfig(_) => "MissingConfigError",
            DbError::InvalidUser(_) => "InvalidUserError",
            DbError::AuthIntegrity(_) => "AuthIntegrityError",
            DbError::DatabaseNotFound(_) => "DatabaseNotFoundError",
            DbError::DatabaseAlreadyExists(_) => "DatabaseAlreadyExistsError",
            DbError::SectionNotFound(_) => "SectionNotFoundError",
            DbError::SectionAlreadyExists(_) => "SectionAlreadyExistsError",
            DbError::IdDoesNotExist(_) => "IdDoesNotExistError",
            DbError::UnknownKey(_) => "UnknownKeyError",
            DbError::SchemaType(_) => "SchemaTypeError",
            DbError::MalformedQuery(_) => "MalformedQueryError",
            DbError::MalformedIdGenerator(_) => "MalformedIdGeneratorError",
            DbError::BadType(_) => "TypeError",
            DbError::InvalidState(_) => "InvalidStateError",
            DbError::Io(_) => "IoError",
        }
    }

    /// Convert into the in-band error response for the session protocol.
    pub fn to_response(&self) -> Response {
        Response::error(self.kind(), self.to_string())
    }

    pub fn section_not_found(section: &str) -> Self {
        DbError::SectionNotFound(format!("section {section} not found in database"))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::SchemaType(format!("malformed database document: {err}"))
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_wire_names() {
        assert_eq!(DbError::UnknownKey(String::new()).kind(), "UnknownKeyError");
        assert_eq!(DbError::BadType(String::new()).kind(), "TypeError");
        assert_eq!(
            DbError::SectionAlreadyExists(String::new()).kind(),
            "SectionAlreadyExistsError"
        );
    }

    #[test]
    fn error_response_carries_kind_and_message() {
        let response = DbError::IdDoesNotExist("'42' does not exist".into()).to_response();
        assert_eq!(response.error, "IdDoesNotExistError");
        assert_eq!(response.data, serde_json::json!("'42' does not exist"));
    }
}
