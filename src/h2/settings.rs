//! HTTP/2 SETTINGS (RFC 7540 Section 6.5)

use std::fmt;

/// Settings parameter identifiers (RFC 7540 Section 6.5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// A set of settings values; `None` means "not present in the frame".
/// Wire order of present entries follows the field order here.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// The protocol defaults an endpoint starts from before any SETTINGS
    /// frame arrives.
    pub fn protocol_defaults() -> Self {
        Settings {
            header_table_size: Some(4096),
            enable_push: Some(true),
            max_concurrent_streams: None,
            initial_window_size: Some(super::DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(super::DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: None,
        }
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size
            .unwrap_or(super::DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(super::DEFAULT_MAX_FRAME_SIZE)
    }

    /// Overlays the entries present in `other`.
    pub fn merge(&mut self, other: &Settings) {
        if let Some(v) = other.header_table_size {
            self.header_table_size = Some(v);
        }
        if let Some(v) = other.enable_push {
            self.enable_push = Some(v);
        }
        if let Some(v) = other.max_concurrent_streams {
            self.max_concurrent_streams = Some(v);
        }
        if let Some(v) = other.initial_window_size {
            self.initial_window_size = Some(v);
        }
        if let Some(v) = other.max_frame_size {
            self.max_frame_size = Some(v);
        }
        if let Some(v) = other.max_header_list_size {
            self.max_header_list_size = Some(v);
        }
    }

    /// The `(identifier, value)` entries this settings block puts on the
    /// wire, in field order.
    pub fn entries(&self) -> Vec<(SettingsParameter, u32)> {
        let mut out = Vec::new();
        if let Some(v) = self.header_table_size {
            out.push((SettingsParameter::HeaderTableSize, v));
        }
        if let Some(v) = self.enable_push {
            out.push((SettingsParameter::EnablePush, u32::from(v)));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((SettingsParameter::MaxConcurrentStreams, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((SettingsParameter::InitialWindowSize, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((SettingsParameter::MaxFrameSize, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((SettingsParameter::MaxHeaderListSize, v));
        }
        out
    }

    /// Validates the bounds RFC 7540 Section 6.5.2 puts on values.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(size) = self.initial_window_size {
            if size > 0x7FFF_FFFF {
                return Err(format!(
                    "initial window size {} exceeds 2^31-1",
                    size
                ));
            }
        }
        if let Some(size) = self.max_frame_size {
            if !(16_384..=16_777_215).contains(&size) {
                return Err(format!("max frame size {} out of range", size));
            }
        }
        Ok(())
    }
}
