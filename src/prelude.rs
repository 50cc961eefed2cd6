pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::broadcast;
pub use tokio_util::sync::CancellationToken;

pub use crate::{
    channels::Channels,
    config::{self, Config, ConfigWrapper},
    coordinator::{self, Coordinator},
    file_error, mqtt,
    options::Options,
    register::{self, ReadBlock, RegisterMap},
    telemetry::{self, CalibrationConfig, RegisterDecoder, TelemetrySnapshot, Value},
    v5::{
        self,
        frame::{FrameType, RawFrame},
    },
};
