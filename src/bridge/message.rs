//! The bridge wire schema.
//!
//! Every message is a JSON object with exactly one known key; anything
//! else on the channel is a fault. Selector and IO-binding shapes carry
//! their own one-of-three validation since their variants share a body
//! with optional siblings (`multi`).

use serde::{Deserialize, Serialize};

use super::BridgeError;

/// A command or response on the kernel/firmware channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub enum Message {
    ElementSelect {
        ed: u64,
        selectors: Vec<Selector>,
    },
    ElementInsert {
        ed: u64,
        #[serde(rename = "innerHTML")]
        inner_html: String,
    },
    ElementReplace {
        ed: u64,
        #[serde(rename = "outerHTML")]
        outer_html: String,
    },
    ElementExec {
        ed: u64,
        /// Identifier of a handler registered on the firmware.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handler: Option<String>,
        /// Raw source text; only honoured behind the unsafe-exec
        /// capability.
        #[serde(rename = "fn", default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        args: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ret_ed: Option<u64>,
    },
    CreateProc {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        executable: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        stdin: IoBinding,
        stdout: IoBinding,
        stderr: IoBinding,
        fid: u64,
    },
    Reap {
        fid: u64,
        status: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    Module {
        /// Module body, base64 or source depending on `kind`.
        module: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default)]
        options: serde_json::Value,
        ed: u64,
    },
    RunLevel(RunLevels),
    Error(serde_json::Value),
    Completed {
        ed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    /// Parse one frame off the channel, refusing objects that do not have
    /// exactly one key.
    pub fn parse(frame: &str) -> Result<Message, BridgeError> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|err| BridgeError::BadFrame(err.to_string()))?;

        let keys = value
            .as_object()
            .map(|map| map.len())
            .ok_or_else(|| BridgeError::BadFrame("frame is not an object".to_owned()))?;
        if keys != 1 {
            return Err(BridgeError::BadFrame(format!(
                "frame has {keys} keys, expected exactly one"
            )));
        }

        serde_json::from_value(value).map_err(|err| BridgeError::BadFrame(err.to_string()))
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("messages always serialize")
    }
}

/// Capability readiness published by the kernel; the firmware enables the
/// matching commands in order of increasing level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunLevels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<u8>,
    #[serde(rename = "create-proc", default, skip_serializing_if = "Option::is_none")]
    pub create_proc: Option<u8>,
}

/// One element selector; the first matching selector in a list wins and
/// the rest are fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    #[serde(rename = "by-id", default, skip_serializing_if = "Option::is_none")]
    pub by_id: Option<String>,
    #[serde(rename = "by-class-name", default, skip_serializing_if = "Option::is_none")]
    pub by_class_name: Option<String>,
    #[serde(rename = "by-tag-name", default, skip_serializing_if = "Option::is_none")]
    pub by_tag_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorKind<'a> {
    ById(&'a str),
    ByClassName { name: &'a str, multi: bool },
    ByTagName { name: &'a str, multi: bool },
}

impl Selector {
    pub fn by_id(id: impl Into<String>) -> Self {
        Selector {
            by_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn by_class_name(name: impl Into<String>) -> Self {
        Selector {
            by_class_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_tag_name(name: impl Into<String>) -> Self {
        Selector {
            by_tag_name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Exactly one of the three shapes must be present.
    pub fn kind(&self) -> Result<SelectorKind<'_>, BridgeError> {
        let multi = self.multi.unwrap_or(false);
        match (&self.by_id, &self.by_class_name, &self.by_tag_name) {
            (Some(id), None, None) => Ok(SelectorKind::ById(id)),
            (None, Some(name), None) => Ok(SelectorKind::ByClassName { name, multi }),
            (None, None, Some(name)) => Ok(SelectorKind::ByTagName { name, multi }),
            _ => Err(BridgeError::BadFrame(
                "selector must name exactly one of by-id, by-class-name, by-tag-name".to_owned(),
            )),
        }
    }
}

/// How one stdio stream of a process is bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoKind<'a> {
    File(&'a str),
    Pipe(bool),
    Null,
}

impl IoBinding {
    pub fn file(path: impl Into<String>) -> Self {
        IoBinding {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn pipe() -> Self {
        IoBinding {
            pipe: Some(true),
            ..Default::default()
        }
    }

    pub fn null() -> Self {
        IoBinding {
            null: Some(true),
            ..Default::default()
        }
    }

    /// Zero or several keys is `BadIoBinding`.
    pub fn kind(&self) -> Result<IoKind<'_>, BridgeError> {
        match (&self.file, &self.pipe, &self.null) {
            (Some(path), None, None) => Ok(IoKind::File(path)),
            (None, Some(capture), None) => Ok(IoKind::Pipe(*capture)),
            (None, None, Some(true)) => Ok(IoKind::Null),
            _ => Err(BridgeError::BadIoBinding),
        }
    }
}
