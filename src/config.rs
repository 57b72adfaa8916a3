use crate::{
    error::{H2Error, LocalError},
    types::{SettingsParameter, MAX_FRAME_SIZE, MAX_WINDOW_SIZE, MIN_FRAME_SIZE},
};

/// Client-side knobs. The first block maps onto the SETTINGS this endpoint
/// advertises; the rest steer handshake and delivery behavior.
#[derive(Debug, Clone)]
pub struct Config {
    /// Advertised SETTINGS_MAX_CONCURRENT_STREAMS; also enforced against the
    /// peer's value when opening streams.
    pub max_concurrent_streams: u32,
    /// Per-stream receive window advertised via SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_window_size: u32,
    /// Largest frame payload this endpoint accepts.
    pub max_frame_size: u32,
    /// Abort threshold for decoded header lists; `u32::MAX` means unbounded.
    pub max_header_list_size: u32,
    /// Maps to SETTINGS_ENABLE_PUSH.
    pub push_enabled: bool,
    /// Surface PUSH_PROMISE exchanges to the application.
    pub send_push_request_upstream: bool,
    /// Never inject the HTTP/1.1 `Upgrade: h2c` dance on cleartext.
    pub never_force_upgrade: bool,
    /// Send the preface immediately after connect instead of upgrading.
    pub prior_knowledge: bool,
    /// Outbound queue depth (frames per lane) before writers suspend.
    pub write_queue_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: u32::MAX,
            push_enabled: true,
            send_push_request_upstream: false,
            never_force_upgrade: false,
            prior_knowledge: false,
            write_queue_frames: 32,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), H2Error> {
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(LocalError::Config(format!(
                "max_frame_size {} outside 2^14..2^24-1",
                self.max_frame_size
            ))
            .into());
        }
        if i64::from(self.initial_window_size) > MAX_WINDOW_SIZE {
            return Err(LocalError::Config(format!(
                "initial_window_size {} exceeds 2^31-1",
                self.initial_window_size
            ))
            .into());
        }
        if self.write_queue_frames == 0 {
            return Err(LocalError::Config("write_queue_frames must be positive".into()).into());
        }
        Ok(())
    }

    /// The SETTINGS payload this endpoint advertises, also used for the
    /// `HTTP2-Settings` upgrade header.
    pub fn local_settings(&self) -> Vec<(SettingsParameter, u32)> {
        let mut params = vec![
            (SettingsParameter::EnablePush, u32::from(self.push_enabled)),
            (
                SettingsParameter::MaxConcurrentStreams,
                self.max_concurrent_streams,
            ),
            (
                SettingsParameter::InitialWindowSize,
                self.initial_window_size,
            ),
            (SettingsParameter::MaxFrameSize, self.max_frame_size),
        ];
        if self.max_header_list_size != u32::MAX {
            params.push((
                SettingsParameter::MaxHeaderListSize,
                self.max_header_list_size,
            ));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn frame_size_bounds_checked() {
        let config = Config {
            max_frame_size: 1 << 24,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn push_disabled_advertised_as_zero() {
        let config = Config {
            push_enabled: false,
            ..Config::default()
        };
        assert!(config
            .local_settings()
            .contains(&(SettingsParameter::EnablePush, 0)));
    }
}
