use std::time::Duration;

use crate::{
    io::ChWrite,
    protocol::DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS,
    Result,
};

pub(crate) const SETTING_FLAG_IMPORTANT: u64 = 0x01;
pub(crate) const SETTING_FLAG_CUSTOM: u64 = 0x02;

/// A typed per-query setting value. All values travel as strings in the
/// settings-as-strings wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    String(String),
    Duration(Duration),
}

impl SettingValue {
    fn render(&self) -> String {
        match self {
            SettingValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            SettingValue::UInt(v) => v.to_string(),
            SettingValue::Int(v) => v.to_string(),
            SettingValue::Float(v) => v.to_string(),
            SettingValue::String(v) => v.clone(),
            // the server expects seconds
            SettingValue::Duration(v) => {
                if v.subsec_nanos() == 0 {
                    v.as_secs().to_string()
                } else {
                    v.as_secs_f64().to_string()
                }
            }
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<u64> for SettingValue {
    fn from(v: u64) -> Self {
        SettingValue::UInt(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::String(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::String(v)
    }
}

impl From<Duration> for SettingValue {
    fn from(v: Duration) -> Self {
        SettingValue::Duration(v)
    }
}

#[derive(Debug, Clone)]
struct Setting {
    name: String,
    value: SettingValue,
    important: bool,
}

/// Named per-query settings, serialized into the query packet after the
/// client identity. Setting names are not validated; unknown names are the
/// server's problem.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    entries: Vec<Setting>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.entries.push(Setting {
            name: name.into(),
            value: value.into(),
            important: false,
        });
        self
    }

    /// An important setting makes the server fail the query rather than
    /// silently ignore a name it does not know.
    pub fn set_important(mut self, name: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.entries.push(Setting {
            name: name.into(),
            value: value.into(),
            important: true,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Writes all entries (without the terminating empty name). Skipped with
    /// a warning for servers predating the strings format.
    pub(crate) async fn write<W: ChWrite>(&self, writer: &mut W, revision: u64) -> Result<()> {
        if revision < DBMS_MIN_REVISION_WITH_SETTINGS_SERIALIZED_AS_STRINGS {
            if !self.entries.is_empty() {
                log::warn!(
                    "server revision {revision} predates string settings, {} settings not sent",
                    self.entries.len()
                );
            }
            return Ok(());
        }
        for entry in &self.entries {
            let flags = if entry.important {
                SETTING_FLAG_IMPORTANT
            } else {
                0
            };
            write_string_setting(writer, &entry.name, flags, &entry.value.render()).await?;
        }
        Ok(())
    }
}

pub(crate) async fn write_string_setting<W: ChWrite>(
    writer: &mut W,
    name: &str,
    flags: u64,
    value: &str,
) -> Result<()> {
    writer.write_string(name).await?;
    writer.write_var_uint(flags).await?;
    writer.write_string(value).await?;
    Ok(())
}
