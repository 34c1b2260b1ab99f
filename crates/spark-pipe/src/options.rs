use crate::error::{PipeError, Result};

/// 默认最小段长度。
pub const DEFAULT_MINIMUM_SEGMENT_SIZE: usize = 4096;

/// 段描述符缓存的默认上限。
pub const DEFAULT_DESCRIPTOR_CACHE_LIMIT: usize = 256;

/// 写端与读端共享的配置面。
///
/// # 契约说明（What）
/// - `minimum_segment_size`：新租借段的最小长度，必须大于 0；
/// - `minimum_read_size`：读端每次拉取至少请求的字节数；未显式设置时取段长的四分之一，
///   且不得超过段长；
/// - `descriptor_cache_limit`：池适配器缓存空闲段描述符的上限，为 0 时不缓存。
///
/// # 使用方式（How）
/// ```
/// use spark_pipe::PipeOptions;
///
/// let options = PipeOptions::default().with_minimum_segment_size(8192);
/// assert_eq!(options.minimum_read_size(), 2048);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipeOptions {
    minimum_segment_size: usize,
    minimum_read_size: Option<usize>,
    descriptor_cache_limit: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            minimum_segment_size: DEFAULT_MINIMUM_SEGMENT_SIZE,
            minimum_read_size: None,
            descriptor_cache_limit: DEFAULT_DESCRIPTOR_CACHE_LIMIT,
        }
    }
}

impl PipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimum_segment_size(mut self, size: usize) -> Self {
        self.minimum_segment_size = size;
        self
    }

    pub fn with_minimum_read_size(mut self, size: usize) -> Self {
        self.minimum_read_size = Some(size);
        self
    }

    pub fn with_descriptor_cache_limit(mut self, limit: usize) -> Self {
        self.descriptor_cache_limit = limit;
        self
    }

    pub fn minimum_segment_size(&self) -> usize {
        self.minimum_segment_size
    }

    /// 读端每次拉取的下限；未设置时为段长的四分之一（至少 1 字节）。
    pub fn minimum_read_size(&self) -> usize {
        self.minimum_read_size
            .unwrap_or_else(|| (self.minimum_segment_size / 4).max(1))
    }

    pub fn descriptor_cache_limit(&self) -> usize {
        self.descriptor_cache_limit
    }

    /// 校验配置的一致性。
    pub fn validate(&self) -> Result<()> {
        if self.minimum_segment_size == 0 {
            return Err(PipeError::InvalidOptions {
                reason: "minimum_segment_size must be greater than zero".to_owned(),
            });
        }
        let read = self.minimum_read_size();
        if read == 0 {
            return Err(PipeError::InvalidOptions {
                reason: "minimum_read_size must be greater than zero".to_owned(),
            });
        }
        if read > self.minimum_segment_size {
            return Err(PipeError::InvalidOptions {
                reason: format!(
                    "minimum_read_size ({read}) exceeds minimum_segment_size ({})",
                    self.minimum_segment_size
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_quarter_rule() {
        let options = PipeOptions::default();
        assert_eq!(options.minimum_segment_size(), 4096);
        assert_eq!(options.minimum_read_size(), 1024);
        assert_eq!(options.descriptor_cache_limit(), 256);
        options.validate().expect("默认配置必须合法");
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let zero = PipeOptions::default().with_minimum_segment_size(0);
        assert_eq!(
            zero.validate().expect_err("零段长必须被拒绝").code(),
            "spark.pipe.invalid_options"
        );

        let too_large = PipeOptions::default()
            .with_minimum_segment_size(128)
            .with_minimum_read_size(256);
        assert!(too_large.validate().is_err());

        let tiny = PipeOptions::default().with_minimum_segment_size(3);
        assert_eq!(tiny.minimum_read_size(), 1, "段长不足 4 时下限取 1 字节");
        tiny.validate().expect("极小段长仍然合法");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserializes_partial_config() {
        let options: PipeOptions =
            serde_json::from_str(r#"{ "minimum_segment_size": 1024 }"#).expect("反序列化失败");
        assert_eq!(options.minimum_segment_size(), 1024);
        assert_eq!(options.minimum_read_size(), 256);
        assert_eq!(options.descriptor_cache_limit(), DEFAULT_DESCRIPTOR_CACHE_LIMIT);
    }
}
