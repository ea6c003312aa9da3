//! Task description builders for tests

use uuid::Uuid;
use weft_core::{
    Direction, Implementation, Parameter, ParameterValue, ResourceDescription, TaskDescription,
};

/// Fluent builder producing [`TaskDescription`]s with sensible defaults.
pub struct TaskBuilder {
    app_id: Uuid,
    signature: String,
    implementations: Vec<Implementation>,
    params: Vec<Parameter>,
    priority: i32,
    group: Option<String>,
}

impl TaskBuilder {
    pub fn new(app_id: Uuid, signature: impl Into<String>) -> Self {
        Self {
            app_id,
            signature: signature.into(),
            implementations: Vec::new(),
            params: Vec::new(),
            priority: 0,
            group: None,
        }
    }

    pub fn implementation(mut self, implementation: Implementation) -> Self {
        self.implementations.push(implementation);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    pub fn in_file(self, path: &str) -> Self {
        self.file(path, Direction::In)
    }

    pub fn out_file(self, path: &str) -> Self {
        self.file(path, Direction::Out)
    }

    pub fn inout_file(self, path: &str) -> Self {
        self.file(path, Direction::InOut)
    }

    pub fn commutative_file(self, path: &str) -> Self {
        self.file(path, Direction::Commutative)
    }

    pub fn concurrent_file(self, path: &str) -> Self {
        self.file(path, Direction::Concurrent)
    }

    fn file(mut self, path: &str, direction: Direction) -> Self {
        self.params.push(Parameter::new(
            path,
            direction,
            ParameterValue::File(path.into()),
        ));
        self
    }

    pub fn in_object(mut self, key: &str, bytes: &[u8]) -> Self {
        self.params.push(Parameter::new(
            key,
            Direction::In,
            ParameterValue::Object {
                key: key.into(),
                bytes: bytes.to_vec(),
            },
        ));
        self
    }

    pub fn out_object(mut self, key: &str) -> Self {
        self.params.push(Parameter::new(
            key,
            Direction::Out,
            ParameterValue::Object {
                key: key.into(),
                bytes: Vec::new(),
            },
        ));
        self
    }

    /// Finish the description. A default single-core implementation is
    /// added when none was declared.
    pub fn build(self) -> TaskDescription {
        let implementations = if self.implementations.is_empty() {
            vec![Implementation::new(
                self.signature.clone(),
                ResourceDescription::new(1, 64),
            )]
        } else {
            self.implementations
        };
        TaskDescription {
            app_id: self.app_id,
            signature: self.signature,
            implementations,
            params: self.params,
            priority: self.priority,
            group: self.group,
        }
    }
}
