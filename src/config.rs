//! Connection configuration and SETTINGS parameters (RFC 9113 Section 6.5).

use std::time::Duration;

use crate::error::ServeError;
use crate::flow::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use crate::frame::{settings_id, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE};
use crate::hpack::DEFAULT_HEADER_TABLE_SIZE;

/// Tunables for one server connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advertised SETTINGS_MAX_CONCURRENT_STREAMS. Default: 250.
    pub max_concurrent_streams: u32,
    /// Advertised SETTINGS_INITIAL_WINDOW_SIZE for each stream. Default: 1 MiB.
    pub initial_stream_window_size: u32,
    /// Connection-level receive window. Default: 1 MiB.
    pub initial_connection_window_size: u32,
    /// Largest frame payload accepted. Default: 16 KiB.
    pub max_frame_size: u32,
    /// Advertised SETTINGS_MAX_HEADER_LIST_SIZE. Default: 16 KiB.
    pub max_header_list_size: u32,
    /// Dynamic table size the HPACK decoder allows the peer. Default: 4096.
    pub decoder_header_table_size: u32,
    /// Dynamic table size our HPACK encoder will use at most. Default: 4096.
    pub encoder_header_table_size: u32,
    /// Close gracefully after this long without live streams. Default: none.
    pub idle_timeout: Option<Duration>,
    /// Reset a stream with CANCEL when it lives longer than this. Default: none.
    pub request_timeout: Option<Duration>,
    /// Unflushed control frames tolerated before the connection is torn
    /// down. Default: 10000.
    pub max_queued_control_frames: usize,
    /// Handlers running at the same time. Default: `max_concurrent_streams`.
    pub max_concurrent_handlers: usize,
    /// Requests waiting for a handler slot before the peer is told to calm
    /// down. Default: 4 times `max_concurrent_handlers`.
    pub max_queued_handlers: usize,
    /// How long queued output may take to drain after a fatal GOAWAY.
    /// Default: 1s.
    pub goaway_flush_timeout: Duration,
    /// Hard deadline for a graceful shutdown. Default: 30s.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let max_concurrent_streams = 250;
        Self {
            max_concurrent_streams,
            initial_stream_window_size: 1 << 20,
            initial_connection_window_size: 1 << 20,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 16 << 10,
            decoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            encoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            idle_timeout: None,
            request_timeout: None,
            max_queued_control_frames: 10_000,
            max_concurrent_handlers: max_concurrent_streams as usize,
            max_queued_handlers: 4 * max_concurrent_streams as usize,
            goaway_flush_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServeError> {
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ServeError::InvalidConfig("max_frame_size must be within 16384..=16777215"));
        }
        if self.initial_stream_window_size > MAX_WINDOW_SIZE {
            return Err(ServeError::InvalidConfig("initial_stream_window_size exceeds 2^31-1"));
        }
        if self.initial_connection_window_size < DEFAULT_WINDOW_SIZE
            || self.initial_connection_window_size > MAX_WINDOW_SIZE
        {
            return Err(ServeError::InvalidConfig(
                "initial_connection_window_size must be within 65535..=2^31-1",
            ));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(ServeError::InvalidConfig("max_concurrent_handlers must be at least 1"));
        }
        if self.max_queued_control_frames == 0 {
            return Err(ServeError::InvalidConfig("max_queued_control_frames must be at least 1"));
        }
        Ok(())
    }

    /// SETTINGS we advertise for this configuration.
    pub fn local_settings(&self) -> Settings {
        Settings {
            header_table_size: self.decoder_header_table_size,
            enable_push: false,
            max_concurrent_streams: Some(self.max_concurrent_streams),
            initial_window_size: self.initial_stream_window_size,
            max_frame_size: self.max_frame_size,
            max_header_list_size: Some(self.max_header_list_size),
        }
    }
}

/// Why a SETTINGS frame was refused. Each maps to a connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("ENABLE_PUSH must be 0 or 1")]
    EnablePush,
    #[error("INITIAL_WINDOW_SIZE above 2^31-1")]
    InitialWindowSize,
    #[error("MAX_FRAME_SIZE out of range")]
    MaxFrameSize,
}

impl SettingsError {
    pub fn code(self) -> crate::error::ErrorCode {
        use crate::error::ErrorCode;
        match self {
            Self::InitialWindowSize => ErrorCode::FlowControlError,
            Self::EnablePush | Self::MaxFrameSize => ErrorCode::ProtocolError,
        }
    }
}

/// One side's SETTINGS values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `None` means unlimited.
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `None` means unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Validate every parameter first, then apply them all. On error `self`
    /// is left untouched. Unknown identifiers are ignored.
    pub fn apply(&mut self, params: &[(u16, u32)]) -> Result<(), SettingsError> {
        for &(id, value) in params {
            match id {
                settings_id::ENABLE_PUSH if value > 1 => return Err(SettingsError::EnablePush),
                settings_id::INITIAL_WINDOW_SIZE if value > MAX_WINDOW_SIZE => {
                    return Err(SettingsError::InitialWindowSize)
                }
                settings_id::MAX_FRAME_SIZE
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
                {
                    return Err(SettingsError::MaxFrameSize)
                }
                _ => {}
            }
        }

        for &(id, value) in params {
            match id {
                settings_id::HEADER_TABLE_SIZE => self.header_table_size = value,
                settings_id::ENABLE_PUSH => self.enable_push = value == 1,
                settings_id::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                settings_id::INITIAL_WINDOW_SIZE => self.initial_window_size = value,
                settings_id::MAX_FRAME_SIZE => self.max_frame_size = value,
                settings_id::MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// (identifier, value) pairs for a SETTINGS frame. Parameters equal to
    /// the protocol default are still sent, except the unlimited ones.
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        let mut params = vec![
            (settings_id::HEADER_TABLE_SIZE, self.header_table_size),
            (settings_id::ENABLE_PUSH, u32::from(self.enable_push)),
        ];
        if let Some(v) = self.max_concurrent_streams {
            params.push((settings_id::MAX_CONCURRENT_STREAMS, v));
        }
        params.push((settings_id::INITIAL_WINDOW_SIZE, self.initial_window_size));
        params.push((settings_id::MAX_FRAME_SIZE, self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            params.push((settings_id::MAX_HEADER_LIST_SIZE, v));
        }
        params
    }
}
