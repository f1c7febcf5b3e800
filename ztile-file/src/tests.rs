//! End-to-end write/read tests over real files.
//!
//! The writer registry allows one live writer per process, so every test
//! that constructs one holds the shared guard.

use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;
use tempfile::TempDir;
use ztile_record::{FieldValue, PType, Record, Schema, SchemaRef, Value};

use crate::{TableReader, TableWriter, WriterOptions};

pub(crate) fn writer_guard() -> MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    static LOG: std::sync::Once = std::sync::Once::new();
    LOG.call_once(|| {
        let _ = simplelog::SimpleLogger::init(
            simplelog::LevelFilter::Warn,
            simplelog::Config::default(),
        );
    });
    GUARD.lock()
}

fn event_schema() -> SchemaRef {
    Schema::builder("Event")
        .scalar("event_id", PType::U32)
        .repeated_scalar("samples", PType::I16)
        .bytes("annotations")
        .build()
}

/// One scalar, one varying i16 array (the first record carries the maximum
/// arity, which fixes the column width), one varying bytes field.
fn make_event(schema: &SchemaRef, i: u64, rng: &mut StdRng, max_samples: usize) -> Record {
    let mut rec = Record::new(schema.clone());
    rec.set("event_id", Value::U32(i as u32 * 3 + 1)).unwrap();
    let n = if i == 0 {
        max_samples
    } else {
        rng.random_range(0..=max_samples)
    };
    rec.set(
        "samples",
        (0..n)
            .map(|j| Value::I16((1000 + (i as i64 % 400) + j as i64 / 3) as i16))
            .collect::<Vec<_>>(),
    )
    .unwrap();
    let blob_len = rng.random_range(0..200);
    rec.set(
        "annotations",
        (0..blob_len).map(|b| (b as u8).wrapping_mul(31)).collect::<Vec<u8>>(),
    )
    .unwrap();
    rec
}

fn write_events(
    path: &std::path::Path,
    options: WriterOptions,
    scheme: &str,
    count: u64,
) -> Vec<Record> {
    let schema = event_schema();
    let mut rng = StdRng::seed_from_u64(7);
    let mut writer = TableWriter::create(path, options).unwrap();
    writer.set_default_compression(scheme).unwrap();

    let mut written = Vec::new();
    for i in 0..count {
        let rec = make_event(&schema, i, &mut rng, 50);
        written.push(rec.clone());
        writer.write_record(rec).unwrap();
    }
    writer.close(false).unwrap();
    written
}

fn assert_events_round_trip(path: &std::path::Path, written: &[Record]) {
    let mut reader = TableReader::open(path, event_schema()).unwrap();
    assert_eq!(reader.num_records(), written.len() as u64);
    for (i, expected) in written.iter().enumerate() {
        let got = reader.read_record(i as u64).unwrap();
        assert_eq!(got, *expected, "record {i}");
        reader.recycle(got);
    }
}

#[test]
fn round_trip_identity_raw() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raw.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_threads: 0,
        ..Default::default()
    };
    let written = write_events(&path, options, "raw", 37);
    assert_events_round_trip(&path, &written);
}

#[rstest]
#[case("zlib")]
#[case("lzo")]
#[case("zstd3")]
#[case("diffman16")]
#[case("doublediffman16")]
#[case("fact")]
#[case("zrice")]
#[case("zrice32")]
#[case("ricefact")]
fn round_trip_identity_per_codec(#[case] scheme: &str) {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(format!("{scheme}.ztile"));
    let options = WriterOptions {
        rows_per_tile: 8,
        num_threads: 0,
        ..Default::default()
    };
    let written = write_events(&path, options, scheme, 25);
    assert_events_round_trip(&path, &written);
}

#[test]
fn tile_boundaries_match_declared_counts() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tiles.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_tiles: 100,
        num_threads: 0,
        ..Default::default()
    };
    // 25 records over 10-row tiles: ceil(25/10) = 3 catalog rows.
    let written = write_events(&path, options, "raw", 25);

    let reader = TableReader::open(&path, event_schema()).unwrap();
    assert_eq!(reader.num_tiles(), 3);
    assert_eq!(reader.shrink_factor(), 1);
    assert_eq!(reader.header().get_int("NAXIS2"), Some(3));
    drop(reader);
    assert_events_round_trip(&path, &written);
}

#[test]
fn shrink_activates_only_over_capacity() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shrunk.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_tiles: 3,
        num_threads: 0,
        ..Default::default()
    };
    // 70 records = 7 tiles against a capacity of 3: factor 3 after padding.
    write_events(&path, options, "raw", 70);

    let mut reader = TableReader::open(&path, event_schema()).unwrap();
    assert_eq!(reader.shrink_factor(), 3);
    assert_eq!(reader.header().get_int("ZTILELEN"), Some(30));
    assert_eq!(reader.header().get_int("NAXIS2"), Some(3));
    assert_eq!(reader.num_tiles(), 3);

    // Rows of surviving tiles stay reachable (tile 1 is original tile 3).
    assert!(reader.read_record(0).is_ok());
    assert!(reader.read_record(35).is_ok());
    // Rows of discarded tiles are gone; that is the documented loss.
    assert!(reader.read_record(15).is_err());
}

#[test]
fn arity_padding_yields_default_instances() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("padding.ztile");

    let item = Schema::builder("Item")
        .scalar("weight", PType::I16)
        .repeated_scalar("tags", PType::U32)
        .build();
    let schema = Schema::builder("Box")
        .scalar("id", PType::U32)
        .repeated_message("items", item.clone())
        .build();

    let mut full = Record::new(schema.clone());
    full.set("id", Value::U32(1)).unwrap();
    for k in 0..3 {
        let slot = full.repeated_message_mut(1, k).unwrap();
        slot.set("weight", Value::I16(10 + k as i16)).unwrap();
        slot.set("tags", vec![Value::U32(k as u32)]).unwrap();
    }
    let mut short = Record::new(schema.clone());
    short.set("id", Value::U32(2)).unwrap();
    {
        let slot = short.repeated_message_mut(1, 0).unwrap();
        slot.set("weight", Value::I16(99)).unwrap();
        slot.set("tags", vec![Value::U32(7)]).unwrap();
    }

    let options = WriterOptions {
        rows_per_tile: 2,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    writer.write_record(full.clone()).unwrap();
    writer.write_record(short).unwrap();
    writer.close(false).unwrap();

    let mut reader = TableReader::open(&path, schema).unwrap();
    let got_full = reader.read_record(0).unwrap();
    assert_eq!(got_full.value(1).repeated_len(), 3);

    let got_short = reader.read_record(1).unwrap();
    let FieldValue::MessageArray(items) = got_short.value(1) else {
        panic!("expected a message array");
    };
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].get("weight"), Some(&FieldValue::Scalar(Value::I16(99))));
    // The two missing slots read back as the default instance: zero weight,
    // empty tags. Not garbage, not an error.
    for slot in &items[1..] {
        assert_eq!(slot.get("weight"), Some(&FieldValue::Scalar(Value::I16(0))));
        assert_eq!(slot.get("tags"), Some(&FieldValue::ScalarArray(Vec::new())));
    }
}

#[test]
fn ordering_holds_under_adversarial_scheduling() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jitter.ztile");
    let options = WriterOptions {
        rows_per_tile: 5,
        num_threads: 4,
        ..Default::default()
    }
    .with_jitter(23);
    let written = write_events(&path, options, "zrice", 200);
    assert_events_round_trip(&path, &written);
}

/// The concrete scenario: 1381 records, tiles of 10, doublediffman16.
#[test]
fn concrete_scenario_1381_records() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scenario.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_tiles: 200,
        num_threads: 2,
        ..Default::default()
    };
    let written = write_events(&path, options, "doublediffman16", 1381);

    let mut reader = TableReader::open(&path, event_schema()).unwrap();
    assert_eq!(reader.num_records(), 1381);

    // Declared row width is the sum of each column's worst-case width.
    let max_blob = written
        .iter()
        .map(|r| match r.get("annotations") {
            Some(FieldValue::Bytes(b)) => b.len() as i64,
            _ => 0,
        })
        .max()
        .unwrap();
    assert_eq!(
        reader.header().get_int("ZNAXIS1"),
        Some(4 + 50 * 2 + max_blob)
    );

    for (i, expected) in written.iter().enumerate() {
        let got = reader.read_record(i as u64).unwrap();
        assert_eq!(got, *expected, "record {i}");
        reader.recycle(got);
    }
}

#[test]
fn vetoed_field_leaves_no_column_and_reads_as_default() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("veto.ztile");

    let foo = Schema::builder("Foo")
        .scalar("bar", PType::I32)
        .scalar("baz", PType::I32)
        .build();
    let schema = Schema::builder("Top")
        .scalar("id", PType::U32)
        .message("foo", foo.clone())
        .build();

    let mut rec = Record::new(schema.clone());
    rec.set("id", Value::U32(1)).unwrap();
    {
        let nested = rec.message_mut(1).unwrap();
        nested.set("bar", Value::I32(41)).unwrap();
        nested.set("baz", Value::I32(42)).unwrap();
    }

    let options = WriterOptions {
        rows_per_tile: 4,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    writer.veto_field("foo.bar");
    writer.write_record(rec).unwrap();
    writer.close(false).unwrap();

    let mut reader = TableReader::open(&path, schema).unwrap();
    // No TPBIDn entry may reference the vetoed field's id path (2.1).
    let mut n = 1;
    while let Some(id) = reader.header().get_str(&format!("TPBID{n}")) {
        assert_ne!(id, "2.1", "vetoed field must not have a column");
        n += 1;
    }
    assert_eq!(n - 1, 2, "only id and foo.baz become columns");

    // Reading succeeds; the vetoed field simply stays at its default.
    let got = reader.read_record(0).unwrap();
    let nested = got.message(1).unwrap();
    assert!(nested.get("bar").unwrap().is_unset());
    assert_eq!(nested.get("baz"), Some(&FieldValue::Scalar(Value::I32(42))));
}

#[test]
fn reader_skips_columns_unknown_to_its_schema() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("compat.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_threads: 0,
        ..Default::default()
    };
    let written = write_events(&path, options, "zlib", 12);

    // A reduced schema without the annotations field: the stored column has
    // no counterpart and is skipped silently.
    let reduced = Schema::builder("Event")
        .scalar("event_id", PType::U32)
        .repeated_scalar("samples", PType::I16)
        .build();
    let mut reader = TableReader::open(&path, reduced).unwrap();
    let got = reader.read_record(3).unwrap();
    assert_eq!(got.get("event_id"), written[3].get("event_id"));
    assert_eq!(got.get("samples"), written[3].get("samples"));
}

#[test]
fn checksum_identity_verifies_and_detects_corruption() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sum.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_threads: 0,
        ..Default::default()
    };
    write_events(&path, options, "zlib", 30);

    let mut reader = TableReader::open(&path, event_schema()).unwrap();
    reader.verify_checksum().unwrap();
    drop(reader);

    // Flip one heap byte; the identity must break.
    let mut bytes = std::fs::read(&path).unwrap();
    let len = bytes.len();
    bytes[len - 2881] ^= 0x5A;
    std::fs::write(&path, bytes).unwrap();

    let mut reader = TableReader::open(&path, event_schema()).unwrap();
    let err = reader.verify_checksum().unwrap_err();
    assert!(matches!(err, ztile_error::ZTileError::ChecksumMismatch(_)));
}

#[test]
fn multiple_tables_in_one_file() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("multi.ztile");
    let schema = event_schema();
    let mut rng = StdRng::seed_from_u64(11);

    let options = WriterOptions {
        rows_per_tile: 5,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    let mut first = Vec::new();
    for i in 0..12 {
        let rec = make_event(&schema, i, &mut rng, 20);
        first.push(rec.clone());
        writer.write_record(rec).unwrap();
    }
    writer.move_to_new_table("CALIB", false).unwrap();
    let mut second = Vec::new();
    for i in 0..7 {
        let rec = make_event(&schema, i, &mut rng, 20);
        second.push(rec.clone());
        writer.write_record(rec).unwrap();
    }
    writer.close(false).unwrap();

    let mut reader = TableReader::open_named(&path, schema.clone(), Some("DATA")).unwrap();
    assert_eq!(reader.num_records(), 12);
    let got = reader.read_record(11).unwrap();
    assert_eq!(got, first[11]);
    drop(reader);

    let mut reader = TableReader::open_named(&path, schema, Some("CALIB")).unwrap();
    assert_eq!(reader.num_records(), 7);
    let got = reader.read_record(0).unwrap();
    assert_eq!(got, second[0]);
}

#[test]
fn configuration_errors_are_immediate() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("errors.ztile");
    let options = WriterOptions {
        rows_per_tile: 10,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options.clone()).unwrap();

    // Only one writer of this kind may be live.
    let err = TableWriter::create(dir.path().join("other.ztile"), options).unwrap_err();
    assert!(err.to_string().contains("only one"));

    // Unknown schemes fail with the listing.
    assert!(writer.set_default_compression("bogus").is_err());

    let schema = event_schema();
    let mut rng = StdRng::seed_from_u64(3);
    let example = make_event(&schema, 0, &mut rng, 10);
    writer.write_record(example.clone()).unwrap();

    // Columns are fixed now: double init and late scheme changes are fatal.
    assert!(writer.init_columns(&example).is_err());
    assert!(writer.set_default_compression("zlib").is_err());

    // A record of a different schema is rejected.
    let other = Record::new(Schema::builder("Other").scalar("x", PType::I32).build());
    let err = writer.write_record(other).unwrap_err();
    assert!(err.to_string().contains("schema"));

    writer.close(false).unwrap();
}

#[test]
fn deferred_worker_errors_surface_at_the_barrier() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deferred.ztile");

    // samevalues32 on unstructured data overflows its bound inside the
    // worker; the failure must come back at the next synchronization point.
    let schema = Schema::builder("Noise")
        .repeated_scalar("values", PType::I32)
        .build();
    let options = WriterOptions {
        rows_per_tile: 4,
        num_threads: 2,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    writer.set_default_compression("samevalues32").unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..8 {
        let mut rec = Record::new(schema.clone());
        rec.set(
            "values",
            (0..4096).map(|_| Value::I32(rng.random())).collect::<Vec<_>>(),
        )
        .unwrap();
        writer.write_record(rec).unwrap();
    }
    let err = writer.close(false).unwrap_err();
    assert!(err.to_string().contains("SameValues32"), "{err}");
}

#[test]
fn any_array_and_enum_round_trip() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("anyarray.ztile");

    let schema = Schema::builder("Frame")
        .scalar("frame_id", PType::U64)
        .enumeration("trigger_type")
        .any_array("waveform")
        .build();

    let mut written = Vec::new();
    let options = WriterOptions {
        rows_per_tile: 4,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    writer
        .request_explicit_compression("waveform", "diffman16")
        .unwrap();
    for i in 0..10u64 {
        let mut rec = Record::new(schema.clone());
        rec.set("frame_id", Value::U64(i << 32 | 5)).unwrap();
        rec.set("trigger_type", FieldValue::Enum((i % 3) as i32)).unwrap();
        let payload: Vec<u8> = (0..40u16)
            .flat_map(|s| (2000 + s * 3 + i as u16).to_le_bytes())
            .collect();
        rec.set(
            "waveform",
            ztile_record::AnyArrayValue::new(PType::U16, payload),
        )
        .unwrap();
        written.push(rec.clone());
        writer.write_record(rec).unwrap();
    }
    writer.close(false).unwrap();

    let mut reader = TableReader::open(&path, schema).unwrap();
    for (i, expected) in written.iter().enumerate() {
        let got = reader.read_record(i as u64).unwrap();
        assert_eq!(got, *expected, "record {i}");
        reader.recycle(got);
    }
}

#[test]
fn lossy_floats_restore_within_precision() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lossy.ztile");

    let schema = Schema::builder("Sensor")
        .any_array("readings")
        .build();

    let values: Vec<f32> = (0..64)
        .map(|i| if i < 48 { 1.0 } else { -2.344 })
        .collect();
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    let options = WriterOptions {
        rows_per_tile: 4,
        num_threads: 0,
        ..Default::default()
    };
    let mut writer = TableWriter::create(&path, options).unwrap();
    writer
        .request_explicit_compression("readings", "samelossyfloats")
        .unwrap();
    for _ in 0..4 {
        let mut rec = Record::new(schema.clone());
        rec.set(
            "readings",
            ztile_record::AnyArrayValue::new(PType::F32, payload.clone()),
        )
        .unwrap();
        writer.write_record(rec).unwrap();
    }
    writer.close(false).unwrap();

    let mut reader = TableReader::open(&path, schema).unwrap();
    let got = reader.read_record(2).unwrap();
    let FieldValue::AnyArray(any) = got.get("readings").unwrap() else {
        panic!("expected an any-array value");
    };
    let restored: Vec<f32> = any
        .data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    for (want, got) in values.iter().zip(&restored) {
        assert!((want - got).abs() <= 0.005 + 1e-6, "{want} vs {got}");
    }
}

#[test]
fn process_default_scheme_is_write_once_before_writers() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("procdefault.ztile");

    let options = WriterOptions {
        rows_per_tile: 4,
        num_threads: 0,
        ..Default::default()
    };
    let writer = TableWriter::create(&path, options).unwrap();
    // With a live writer slot, changing the process-wide default is fatal.
    let err = crate::set_process_default_scheme("zlib").unwrap_err();
    assert!(err.to_string().contains("before any writer"));
    drop(writer);

    crate::set_process_default_scheme("zstd5").unwrap();
    assert_eq!(crate::process_default_scheme().as_deref(), Some("zstd5"));
    assert_eq!(WriterOptions::default().default_scheme, "zstd5");
    // Leave the default as other tests expect it.
    crate::set_process_default_scheme("raw").unwrap();
}

#[test]
fn records_recycle_through_the_reader_pool() {
    let _guard = writer_guard();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("recycle.ztile");
    let options = WriterOptions {
        rows_per_tile: 5,
        num_threads: 0,
        ..Default::default()
    };
    let written = write_events(&path, options, "raw", 20);

    let mut reader = TableReader::open(&path, event_schema()).unwrap();
    // Crossing tile boundaries with recycling active must not corrupt
    // anything: recycled records are cleared before reuse.
    for i in (0..20).rev() {
        let got = reader.read_record(i as u64).unwrap();
        assert_eq!(got, written[i], "record {i}");
        reader.recycle(got);
    }
}
