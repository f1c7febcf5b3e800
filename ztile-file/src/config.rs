use rustc_hash::FxHashMap;
use ztile_codec::{parse_scheme, CodecParams, Pipeline, Scheme};
use ztile_error::ZTileResult;

/// The compression configuration of one table: a default pipeline plus
/// per-field-path overrides, all resolved from scheme names.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    default_name: String,
    default_pipeline: Pipeline,
    explicit: FxHashMap<String, (String, Pipeline)>,
    params: CodecParams,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_name: "raw".to_string(),
            default_pipeline: Pipeline::raw(),
            explicit: FxHashMap::default(),
            params: CodecParams::default(),
        }
    }
}

impl CompressionConfig {
    pub fn new(default_scheme: &str) -> ZTileResult<Self> {
        let mut config = Self::default();
        config.set_default(default_scheme)?;
        Ok(config)
    }

    /// Set the table default. Preset names install their override bundle.
    pub fn set_default(&mut self, scheme_name: &str) -> ZTileResult<()> {
        match parse_scheme(scheme_name)? {
            Scheme::Pipeline {
                name,
                pipeline,
                zstd_level,
            } => {
                if let Some(level) = zstd_level {
                    self.params.zstd_level = level;
                }
                self.default_name = name;
                self.default_pipeline = pipeline;
            }
            Scheme::Preset {
                default, overrides, ..
            } => {
                if let Some(default) = default {
                    self.set_default(default)?;
                }
                for (field, scheme) in overrides {
                    self.request_explicit(field, scheme)?;
                }
            }
        }
        Ok(())
    }

    /// Bind a field path to a scheme. Preset names expand to their bundle.
    pub fn request_explicit(&mut self, field_path: &str, scheme_name: &str) -> ZTileResult<()> {
        match parse_scheme(scheme_name)? {
            Scheme::Pipeline {
                name,
                pipeline,
                zstd_level,
            } => {
                if let Some(level) = zstd_level {
                    self.params.zstd_level = level;
                }
                self.explicit
                    .insert(field_path.to_string(), (name, pipeline));
            }
            Scheme::Preset {
                default, overrides, ..
            } => {
                if let Some(default) = default {
                    self.set_default(default)?;
                }
                for (field, scheme) in overrides {
                    self.request_explicit(field, scheme)?;
                }
            }
        }
        Ok(())
    }

    /// The pipeline and scheme name for a flattened field path.
    pub fn lookup(&self, field_path: &str) -> (&str, &Pipeline) {
        match self.explicit.get(field_path) {
            Some((name, pipeline)) => (name, pipeline),
            None => (&self.default_name, &self.default_pipeline),
        }
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut CodecParams {
        &mut self.params
    }

    pub fn default_scheme_name(&self) -> &str {
        &self.default_name
    }
}

#[cfg(test)]
mod test {
    use ztile_codec::Stage;

    use super::CompressionConfig;

    #[test]
    fn explicit_overrides_win_over_default() {
        let mut config = CompressionConfig::new("zlib").unwrap();
        config.request_explicit("hiGain.waveforms.samples", "diffman16").unwrap();

        let (name, pipeline) = config.lookup("hiGain.waveforms.samples");
        assert_eq!(name, "diffman16");
        assert_eq!(pipeline.stages(), &[Stage::Delta, Stage::Huffman16]);

        let (name, _) = config.lookup("anything.else");
        assert_eq!(name, "zlib");
    }

    #[test]
    fn presets_install_bundles() {
        let mut config = CompressionConfig::default();
        config.set_default("nectarcam").unwrap();
        assert_eq!(config.default_scheme_name(), "raw");
        assert_eq!(config.lookup("waveform").0, "diffman16");
        // zstd-1 in the bundle set the shared level.
        assert_eq!(config.params().zstd_level, -1);
    }

    #[test]
    fn unknown_scheme_propagates() {
        assert!(CompressionConfig::new("not-a-scheme").is_err());
    }
}
