use ztile_error::{ztile_bail, ZTileResult};

use crate::{Pipeline, Stage};

/// Everything a scheme name can resolve to.
#[derive(Debug, Clone, PartialEq)]
pub enum Scheme {
    /// A stage pipeline, with the Zstandard level when the name carried one.
    Pipeline {
        name: String,
        pipeline: Pipeline,
        zstd_level: Option<i32>,
    },
    /// A named preset: a new default plus per-field-path overrides, applied
    /// in bulk by the writer.
    Preset {
        name: String,
        default: Option<&'static str>,
        overrides: Vec<(&'static str, &'static str)>,
    },
}

impl Scheme {
    pub fn name(&self) -> &str {
        match self {
            Scheme::Pipeline { name, .. } => name,
            Scheme::Preset { name, .. } => name,
        }
    }
}

const SCHEME_HELP: &[(&str, &str)] = &[
    ("raw", "no compression"),
    ("zlib", "the well-known zlib"),
    ("lzo", "LZO-class one-shot block compression"),
    ("rice", "native 16-bits RICE"),
    ("huffman16", "huffman encoding on 16 bits"),
    ("fact", "average difference with 2 previous samples, then huffman 16 bits"),
    ("diffman16", "difference with previous sample, then huffman 16 bits"),
    (
        "doublediffman16",
        "difference with previous sample, then offset of 128, then 16-bits splitting, then zlib",
    ),
    ("riceman16", "32-bits splitting then two huffmans, one per plane"),
    (
        "factrice",
        "average difference with 2 previous samples, then 16-bits splitting, then two huffmans",
    ),
    ("ricefact", "the symmetric of factrice: splitting, smoothing, two huffmans"),
    ("rrice", "16-bits splitting then native 16-bits RICE"),
    ("zrice", "16-bits splitting then zlib"),
    ("zrice32", "32-bits splitting then zlib"),
    ("lzorice", "16-bits splitting then LZO"),
    ("samevalues32", "32-bits same-value run collapsing"),
    ("sparsevalues32", "32-bits sparse-value run collapsing"),
    ("samelossyfloats", "lossy floats then same-value collapsing"),
    ("sparselossyfloats", "lossy floating point, precision 0.01"),
    ("lossyint16", "lossy 16-bits quantization, then diffman16"),
    ("lossyint32", "lossy 32-bits quantization, then riceman16"),
    ("zstdX", "z-standard level X, with X between -1 and 22"),
    ("digicam", "digicam specific compression"),
    ("nectarcam", "nectarcam specific compression"),
    ("lst", "lst-cam specific compression"),
];

/// Resolve a compression scheme name.
///
/// Unknown names fail with a message listing every valid name, so a typo in
/// operator configuration is self-explaining.
pub fn parse_scheme(name: &str) -> ZTileResult<Scheme> {
    let stages: Vec<Stage> = match name {
        "raw" => vec![Stage::Raw],
        "zlib" => vec![Stage::Zlib],
        "lzo" => vec![Stage::Lzo],
        "rice" => vec![Stage::Rice],
        "huffman16" => vec![Stage::Huffman16],
        "fact" => vec![Stage::Smoothing, Stage::Huffman16],
        "diffman16" => vec![Stage::Delta, Stage::Huffman16],
        "doublediffman16" => vec![
            Stage::Delta,
            Stage::Offset128,
            Stage::SplitHiLo16,
            Stage::Zlib,
        ],
        "riceman16" => vec![Stage::SplitHiLo32, Stage::Halfman16],
        "factrice" => vec![Stage::Smoothing, Stage::SplitHiLo16, Stage::Halfman16],
        "ricefact" => vec![Stage::SplitHiLo16, Stage::Smoothing, Stage::Halfman16],
        "rrice" => vec![Stage::SplitHiLo16, Stage::Rice],
        "zrice" => vec![Stage::SplitHiLo16, Stage::Zlib],
        "zrice32" => vec![Stage::SplitHiLo32, Stage::Zlib],
        "lzorice" => vec![Stage::SplitHiLo16, Stage::Lzo],
        "samevalues32" => {
            log::warn!(
                "the samevalues32 scheme only works on arrays with long runs of identical \
                 values; compression fails on data without that structure"
            );
            vec![Stage::SameValues32, Stage::SplitHiLo32, Stage::Zlib]
        }
        "sparsevalues32" => {
            log::warn!(
                "the sparsevalues32 scheme only works on sparse arrays; compression fails on \
                 data without that structure"
            );
            vec![Stage::SparseValues32, Stage::SplitHiLo32, Stage::Zlib]
        }
        "samelossyfloats" => {
            log::warn!("lossy compression scheme samelossyfloats is experimental");
            vec![
                Stage::LossyFloats,
                Stage::SameValues32,
                Stage::SplitHiLo32,
                Stage::Zlib,
            ]
        }
        "sparselossyfloats" => {
            log::warn!("lossy compression scheme sparselossyfloats is experimental");
            vec![
                Stage::LossyFloats,
                Stage::SparseValues32,
                Stage::SplitHiLo32,
                Stage::Zlib,
            ]
        }
        "lossyint16" => vec![Stage::LossyInt16, Stage::Delta, Stage::Huffman16],
        "lossyint32" => vec![Stage::LossyInt32, Stage::SplitHiLo32, Stage::Halfman16],
        "digicam" => {
            return Ok(Scheme::Preset {
                name: name.to_string(),
                default: None,
                overrides: vec![
                    ("telescopeID", "zrice"),
                    ("trigger_output_patch7", "zlib"),
                    ("trigger_output_patch19", "zrice32"),
                    ("eventNumber", "ricefact"),
                    ("hiGain.waveforms.samples", "diffman16"),
                    ("hiGain.waveforms.baselines", "zrice"),
                    ("hiGain.waveforms.pixelsIndices", "doublediffman16"),
                    ("local_time_nanosec", "zlib"),
                    ("local_time_sec", "zlib"),
                    ("pixels_flags", "zlib"),
                    ("event_type", "zrice"),
                    ("trigger_input_traces", "zlib"),
                ],
            })
        }
        "nectarcam" => {
            return Ok(Scheme::Preset {
                name: name.to_string(),
                default: Some("raw"),
                overrides: vec![
                    ("waveform", "diffman16"),
                    ("pixel_status", "zstd-1"),
                    ("nectarcam.counters", "zrice"),
                ],
            })
        }
        "lst" => {
            return Ok(Scheme::Preset {
                name: name.to_string(),
                default: None,
                overrides: vec![
                    ("configuration_id", "zrice32"),
                    ("event_id", "zrice32"),
                    ("tel_event_id", "zrice32"),
                    ("trigger_time_s", "zrice32"),
                    ("trigger_time_qns", "zrice32"),
                    ("trigger_type", "zrice32"),
                    ("waveform", "fact"),
                    ("pixel_status", "zlib"),
                    ("ped_id", "zrice32"),
                    ("lstcam.module_status", "lzo"),
                    ("lstcam.extdevices_presence", "zrice32"),
                    ("lstcam.tib_data", "zrice32"),
                    ("lstcam.cdts_data", "zrice32"),
                    ("lstcam.swat_data", "zrice32"),
                    ("lstcam.counters", "zlib"),
                    ("lstcam.chips_flags", "zrice32"),
                    ("lstcam.first_capacitor_id", "doublediffman16"),
                    ("lstcam.drs_tag_status", "lzo"),
                    ("lstcam.drs_tag", "fact"),
                ],
            })
        }
        other if other.starts_with("zstd") => {
            let level = match &other[4..] {
                "" => None,
                suffix => match suffix.parse::<i32>() {
                    Ok(level) if (-1..=22).contains(&level) => Some(level),
                    _ => ztile_bail!(
                        Configuration: "invalid zstd level '{}'; expected an integer between -1 and 22", suffix
                    ),
                },
            };
            return Ok(Scheme::Pipeline {
                name: other.to_string(),
                pipeline: Pipeline::new(vec![Stage::Zstd])?,
                zstd_level: level,
            });
        }
        unknown => {
            let listing = SCHEME_HELP
                .iter()
                .map(|(n, what)| format!("  {n:>17}: {what}"))
                .collect::<Vec<_>>()
                .join("\n");
            ztile_bail!(
                Configuration: "unknown compression scheme: {}; acceptable values are:\n{}", unknown, listing
            );
        }
    };

    Ok(Scheme::Pipeline {
        name: name.to_string(),
        pipeline: Pipeline::new(stages)?,
        zstd_level: None,
    })
}

#[cfg(test)]
mod test {
    use super::{parse_scheme, Scheme};
    use crate::Stage;

    fn stages_of(name: &str) -> Vec<Stage> {
        match parse_scheme(name).unwrap() {
            Scheme::Pipeline { pipeline, .. } => pipeline.stages().to_vec(),
            other => panic!("{name} resolved to {other:?}"),
        }
    }

    #[test]
    fn known_pipelines_resolve() {
        assert_eq!(stages_of("raw"), vec![Stage::Raw]);
        assert_eq!(
            stages_of("doublediffman16"),
            vec![Stage::Delta, Stage::Offset128, Stage::SplitHiLo16, Stage::Zlib]
        );
        assert_eq!(
            stages_of("ricefact"),
            vec![Stage::SplitHiLo16, Stage::Smoothing, Stage::Halfman16]
        );
        assert_eq!(stages_of("zrice"), vec![Stage::SplitHiLo16, Stage::Zlib]);
    }

    #[test]
    fn zstd_levels_parse() {
        match parse_scheme("zstd5").unwrap() {
            Scheme::Pipeline { zstd_level, .. } => assert_eq!(zstd_level, Some(5)),
            other => panic!("unexpected {other:?}"),
        }
        match parse_scheme("zstd-1").unwrap() {
            Scheme::Pipeline { zstd_level, .. } => assert_eq!(zstd_level, Some(-1)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_scheme("zstd99").is_err());
    }

    #[test]
    fn presets_expand_to_overrides() {
        match parse_scheme("lst").unwrap() {
            Scheme::Preset {
                default, overrides, ..
            } => {
                assert_eq!(default, None);
                assert!(overrides.contains(&("waveform", "fact")));
                assert_eq!(overrides.len(), 19);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_scheme("nectarcam").unwrap() {
            Scheme::Preset { default, .. } => assert_eq!(default, Some("raw")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_scheme_lists_valid_names() {
        let err = parse_scheme("bogus").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown compression scheme: bogus"));
        assert!(msg.contains("doublediffman16"));
        assert!(msg.contains("nectarcam"));
    }
}
