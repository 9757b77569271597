//! Encode profiles and the profile selector.
//!
//! Profiles are configuration: the pipeline never creates them. The selector
//! decides which active profiles a given source is encoded into and at which
//! dispatch priority.

use crate::config::{ConfigError, ProfileConfig};
use serde::{Deserialize, Serialize};

/// Identifier of an encode profile.
pub type ProfileId = u32;

/// Container of an encode profile's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Extension {
    Mp4,
    Webm,
    Gif,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Mp4 => "mp4",
            Extension::Webm => "webm",
            Extension::Gif => "gif",
        }
    }
}

impl std::str::FromStr for Extension {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mp4" => Ok(Extension::Mp4),
            "webm" => Ok(Extension::Webm),
            "gif" => Ok(Extension::Gif),
            other => Err(ConfigError::Invalid(format!("unknown extension '{}'", other))),
        }
    }
}

/// Target video height of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Resolution {
    R240,
    R360,
    R480,
    R720,
    R1080,
    R1440,
    R2160,
}

impl Resolution {
    pub const ALL: [Resolution; 7] = [
        Resolution::R2160,
        Resolution::R1440,
        Resolution::R1080,
        Resolution::R720,
        Resolution::R480,
        Resolution::R360,
        Resolution::R240,
    ];

    pub fn height(&self) -> u32 {
        match self {
            Resolution::R240 => 240,
            Resolution::R360 => 360,
            Resolution::R480 => 480,
            Resolution::R720 => 720,
            Resolution::R1080 => 1080,
            Resolution::R1440 => 1440,
            Resolution::R2160 => 2160,
        }
    }
}

impl TryFrom<u32> for Resolution {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Resolution::ALL
            .iter()
            .copied()
            .find(|r| r.height() == value)
            .ok_or_else(|| ConfigError::Invalid(format!("unsupported resolution {}", value)))
    }
}

impl From<Resolution> for u32 {
    fn from(r: Resolution) -> Self {
        r.height()
    }
}

/// Video codec of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H265,
    H264,
    Vp9,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H265 => "h265",
            Codec::H264 => "h264",
            Codec::Vp9 => "vp9",
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h265" => Ok(Codec::H265),
            "h264" => Ok(Codec::H264),
            "vp9" => Ok(Codec::Vp9),
            other => Err(ConfigError::Invalid(format!("unknown codec '{}'", other))),
        }
    }
}

/// A target format every eligible source is encoded into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub id: ProfileId,
    pub name: String,
    pub extension: Extension,
    /// `None` only for gif profiles.
    pub resolution: Option<Resolution>,
    /// `None` only for gif profiles.
    pub codec: Option<Codec>,
    pub active: bool,
}

impl EncodeProfile {
    pub fn is_gif(&self) -> bool {
        self.extension == Extension::Gif
    }

    pub fn is_h264(&self) -> bool {
        self.codec == Some(Codec::H264)
    }
}

impl TryFrom<&ProfileConfig> for EncodeProfile {
    type Error = ConfigError;

    fn try_from(cfg: &ProfileConfig) -> Result<Self, Self::Error> {
        let extension: Extension = cfg.extension.parse()?;
        let resolution = cfg.resolution.map(Resolution::try_from).transpose()?;
        let codec = cfg.codec.as_deref().map(str::parse::<Codec>).transpose()?;

        if extension != Extension::Gif && (resolution.is_none() || codec.is_none()) {
            return Err(ConfigError::Invalid(format!(
                "profile '{}' needs both a resolution and a codec",
                cfg.name
            )));
        }

        Ok(Self {
            id: cfg.id,
            name: cfg.name.clone(),
            extension,
            resolution,
            codec,
            active: cfg.active,
        })
    }
}

/// The configured profile set, ordered by resolution.
#[derive(Debug, Clone, Default)]
pub struct Profiles {
    profiles: Vec<EncodeProfile>,
}

impl Profiles {
    pub fn new(mut profiles: Vec<EncodeProfile>) -> Self {
        profiles.sort_by_key(|p| (p.resolution, p.id));
        Self { profiles }
    }

    pub fn from_config(cfgs: &[ProfileConfig]) -> Result<Self, ConfigError> {
        let profiles = cfgs
            .iter()
            .map(EncodeProfile::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(profiles))
    }

    pub fn get(&self, id: ProfileId) -> Option<&EncodeProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn active(&self) -> Vec<EncodeProfile> {
        self.profiles.iter().filter(|p| p.active).cloned().collect()
    }

    pub fn all(&self) -> &[EncodeProfile] {
        &self.profiles
    }
}

/// Dispatch tier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    /// Numeric priority as understood by external brokers.
    pub fn value(&self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 9,
        }
    }

    /// Profiles in the minimum-resolution set go out on the high tier.
    pub fn for_profile(profile: &EncodeProfile, minimum_resolutions: &[u32]) -> Self {
        match profile.resolution {
            Some(r) if minimum_resolutions.contains(&r.height()) => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// A profile chosen for a source, with its dispatch priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedProfile {
    pub profile: EncodeProfile,
    pub priority: Priority,
}

/// Chooses the profiles a source should be encoded into.
///
/// Inactive profiles are dropped. A non-gif profile is skipped when the source
/// is shorter than its target height, unless that height is in
/// `minimum_resolutions` (small variants must always exist for adaptive
/// streaming). Gif profiles are never skipped by height. An unknown source
/// height skips nothing. Input order is preserved.
pub fn select_profiles(
    profiles: &[EncodeProfile],
    source_height: Option<u32>,
    minimum_resolutions: &[u32],
) -> Vec<SelectedProfile> {
    profiles
        .iter()
        .filter(|p| p.active)
        .filter(|p| {
            if p.is_gif() {
                return true;
            }
            match (source_height, p.resolution) {
                (Some(height), Some(res)) if height < res.height() => {
                    minimum_resolutions.contains(&res.height())
                }
                _ => true,
            }
        })
        .map(|p| SelectedProfile {
            profile: p.clone(),
            priority: Priority::for_profile(p, minimum_resolutions),
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_profile(
    id: ProfileId,
    extension: Extension,
    resolution: Option<Resolution>,
    codec: Option<Codec>,
) -> EncodeProfile {
    EncodeProfile {
        id,
        name: format!("profile-{}", id),
        extension,
        resolution,
        codec,
        active: true,
    }
}
