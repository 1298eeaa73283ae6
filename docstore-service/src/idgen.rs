use uuid::Uuid;

/// Record-ID generation strategy, selected by wire name through
/// `SET_ID_GENERATOR`. The default derives an 18-character decimal string
/// from a random 128-bit value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdGenerator {
    Uuid18,
    Uuid4,
    Counter(u64),
}

impl Default for IdGenerator {
    fn default() -> Self {
        IdGenerator::Uuid18
    }
}

impl IdGenerator {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uuid18" => Some(IdGenerator::Uuid18),
            "uuid4" => Some(IdGenerator::Uuid4),
            "counter" => Some(IdGenerator::Counter(0)),
            _ => None,
        }
    }

    pub fn next_id(&mut self) -> String {
        match self {
            IdGenerator::Uuid18 => Uuid::new_v4()
                .as_u128()
                .to_string()
                .chars()
                .take(18)
                .collect(),
            IdGenerator::Uuid4 => Uuid::new_v4().to_string(),
            IdGenerator::Counter(last) => {
                *last += 1;
                last.to_string()
            }
        }
    }
}
