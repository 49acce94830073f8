use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::{Event, Greeting};

/// The `error` object returned by QMP and the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    /// Error class, e.g. `GenericError`.
    #[serde(default)]
    pub class: String,
    /// Error description.
    #[serde(default)]
    pub desc: String,
}

impl CommandError {
    /// Read an `error` payload without failing.
    ///
    /// A payload that is not an object, or that carries no description,
    /// keeps its raw JSON text as `desc`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(err) if !err.desc.is_empty() => err,
            Ok(err) => Self {
                class: err.class,
                desc: value.to_string(),
            },
            Err(_) => Self {
                class: String::new(),
                desc: value.to_string(),
            },
        }
    }
}

/// An outbound JSON command, `{"execute": name, "arguments": {...}}`.
///
/// The same shape is used by QMP and by the guest agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub execute: String,

    /// Command arguments; omitted from the wire when absent.
    #[serde(rename = "arguments", default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Command {
    /// A command without arguments.
    #[must_use]
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            args: None,
        }
    }

    /// A command with an `arguments` object.
    #[must_use]
    pub fn with_args(execute: impl Into<String>, args: Value) -> Self {
        Self {
            execute: execute.into(),
            args: Some(args),
        }
    }

    /// Serialize to a single wire line (without the terminator).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

/// One decoded QMP line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Successful `return` payload of the oldest in-flight command.
    Return(Value),
    /// `error` answer to the oldest in-flight command.
    Error(CommandError),
    /// Asynchronous event; never correlated with a command.
    Event(Event),
    /// Connection greeting; only valid as the first line.
    Greeting(Greeting),
}

impl Response {
    /// Classify a decoded JSON object by its top-level key.
    ///
    /// `error` wins over `return`, so a malformed object carrying both is
    /// treated as a failure.
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::protocol("QMP message is not a JSON object"));
        };

        if let Some(err) = map.remove("error") {
            return Ok(Self::Error(CommandError::from_value(err)));
        }

        if let Some(ret) = map.remove("return") {
            return Ok(Self::Return(ret));
        }

        if map.contains_key("event") {
            let ev: Event = serde_json::from_value(Value::Object(map)).map_err(Error::from)?;
            return Ok(Self::Event(ev));
        }

        if map.contains_key("QMP") {
            let g: Greeting = serde_json::from_value(Value::Object(map)).map_err(Error::from)?;
            return Ok(Self::Greeting(g));
        }

        Err(Error::protocol("unrecognized QMP message"))
    }

    /// Parse and classify a raw wire line.
    pub fn from_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line).map_err(Error::from)?;
        Self::classify(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_without_arguments_omits_the_key() {
        let line = Command::new("qmp_capabilities").to_line().expect("encode");
        assert_eq!(line, r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn command_with_arguments() {
        let cmd = Command::with_args("guest-exec-status", json!({"pid": 7}));
        let v: Value = serde_json::from_str(&cmd.to_line().expect("encode")).expect("json");
        assert_eq!(v, json!({"execute": "guest-exec-status", "arguments": {"pid": 7}}));
    }

    #[test]
    fn classifies_each_message_kind() {
        assert_eq!(
            Response::from_line(r#"{"return": {}}"#).expect("return"),
            Response::Return(json!({}))
        );

        match Response::from_line(r#"{"error": {"class": "GenericError", "desc": "boom"}}"#)
            .expect("error")
        {
            Response::Error(e) => assert_eq!(e.desc, "boom"),
            other => panic!("unexpected {other:?}"),
        }

        match Response::from_line(
            r#"{"event": "STOP", "data": {}, "timestamp": {"seconds": 1, "microseconds": 2}}"#,
        )
        .expect("event")
        {
            Response::Event(ev) => {
                assert_eq!(ev.name, "STOP");
                assert_eq!(ev.timestamp.map(|t| t.microseconds), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }

        match Response::from_line(
            r#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 2, "major": 8}, "package": "v8.2.1"}, "capabilities": ["oob"]}}"#,
        )
        .expect("greeting")
        {
            Response::Greeting(g) => assert_eq!(g.qmp.version.to_string(), "8.2.1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn return_null_is_still_a_reply() {
        let r = Response::from_line(r#"{"return": null}"#).expect("return");
        assert_eq!(r, Response::Return(Value::Null));
    }

    #[test]
    fn error_without_description_is_still_an_error() {
        match Response::from_line(r#"{"error": {"class": "GenericError"}}"#).expect("error") {
            Response::Error(e) => {
                assert_eq!(e.class, "GenericError");
                assert_eq!(e.desc, r#"{"class":"GenericError"}"#);
            }
            other => panic!("unexpected {other:?}"),
        }

        match Response::from_line(r#"{"error": "out of memory"}"#).expect("error") {
            Response::Error(e) => {
                assert_eq!(e.class, "");
                assert_eq!(e.desc, r#""out of memory""#);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Response::from_line("{\"ret").is_err());
        assert!(Response::from_line("[1, 2]").is_err());
        assert!(Response::from_line(r#"{"timestamp": 1}"#).is_err());
    }
}
