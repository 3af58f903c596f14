use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use lpc_tm::aggregator::{aggregate, FileStatus};
use lpc_tm::layout::COLUMNS;
use lpc_tm::pipeline::{convert_packets, process_directory, PacketJob, PacketStatus};
use lpc_tm::{AggregationConfig, BinLayout, LpcConfig, LpcError};

const TIME_HIGH: u16 = 24_000;

fn chunk(time_low: u16, flow: u16, temperature: u16) -> Vec<u8> {
    let mut words = [0u16; 16];
    words[0] = time_low;
    words[1] = TIME_HIGH;
    words[2] = 350;
    words[9] = flow;
    for w in words.iter_mut().skip(11) {
        *w = temperature;
    }
    [5u16; 16]
        .iter()
        .chain([1u16; 16].iter())
        .chain(words.iter())
        .flat_map(|w| w.to_be_bytes())
        .collect()
}

fn packet_bytes(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = vec![0u8; 36 + 96];
    for c in chunks {
        payload.extend_from_slice(c);
    }
    assert!(!payload.windows(3).any(|w| w == b"END"));

    let mut packet = b"<TM><Msg>7</Msg><StateMess1>LPC: sampling</StateMess1></TM>\n".to_vec();
    packet.extend_from_slice(b"START");
    packet.extend_from_slice(&payload);
    packet.extend_from_slice(b"END\n");
    packet
}

fn write_gz(path: &Path, bytes: &[u8]) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    fs::write(path, encoder.finish().unwrap()).unwrap();
}

fn write_packet(path: &Path, rows: u16) {
    let chunks: Vec<Vec<u8>> = (0..rows).map(|i| chunk(100 + i, 1_500, 29_315)).collect();
    write_gz(path, &packet_bytes(&chunks));
}

fn data_line(time: f64, flow: f64, temperature: f64) -> String {
    let mut fields = vec!["1".to_string(); COLUMNS];
    fields[0] = time.to_string();
    fields[8] = flow.to_string();
    fields[10] = temperature.to_string();
    fields.join(",")
}

/// 3行のヘッダーと3行の空行を持つCSVを作成する。
///
/// 列名と単位の行の末尾にはファイル名を入れる。
fn write_csv(path: &Path, rows: &[String]) {
    let tag = path.file_stem().unwrap().to_string_lossy();
    let mut text =
        format!("Instrument: ,LPC\r\nTime,{tag}\r\n[Unix Time],{tag}\r\n\r\n\r\n\r\n");
    for row in rows {
        text.push_str(row);
        text.push_str("\r\n");
    }
    fs::write(path, text).unwrap();
}

fn data_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with("Time") && !l.starts_with("[Unix"))
        .map(|l| l.to_string())
        .collect()
}

fn test_config(root: &Path) -> LpcConfig {
    LpcConfig {
        raw_dir: root.join("raw"),
        csv_dir: root.join("csv"),
        mean_file: root.join("mean.csv"),
        master_file: root.join("master.csv"),
        state_log_file: root.join("log.txt"),
        ..LpcConfig::default()
    }
}

fn glob(dir: &Path) -> String {
    dir.join("*.csv").to_string_lossy().into_owned()
}

#[test]
fn process_directory_decodes_and_aggregates() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    fs::create_dir(&config.raw_dir).unwrap();
    for name in ["ST2_a.LPC.dat.gz", "ST2_b.LPC.dat.gz", "TM_c.LPC.dat.gz"] {
        write_packet(&config.raw_dir.join(name), 8);
    }

    let report = process_directory(&config, &BinLayout::default()).unwrap();
    assert_eq!(report.batch.converted(), 3);
    assert_eq!(report.batch.failures().count(), 0);

    let csv = config.csv_dir.join("ST2_a.LPC.csv");
    let text = fs::read_to_string(&csv).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6 + 8);
    assert!(lines[0].starts_with("Instrument: ,LPC-0002,"));
    assert_eq!(lines[3..6], ["", "", ""]);
    let first: Vec<&str> = lines[6].split(',').collect();
    assert_eq!(first.len(), COLUMNS);
    let t0 = 100 + TIME_HIGH as i64 * 65_535;
    assert_eq!(first[0], t0.to_string());
    assert_eq!(first[1], "350");
    assert_eq!(first[8], "1.5");

    let aggregation = report.aggregation.unwrap().unwrap();
    assert_eq!(aggregation.files.len(), 3);
    // マスターには復号したすべての行が入る
    assert_eq!(aggregation.master_rows(), 3 * 8);
    assert_eq!(aggregation.mean_rows(), 3);
    assert_eq!(data_lines(&config.master_file).len(), 24);

    let mean = data_lines(&config.mean_file);
    assert_eq!(mean.len(), 3);
    let fields: Vec<&str> = mean[0].split(',').collect();
    assert_eq!(fields.len(), COLUMNS + 1);
    assert_eq!(fields[0], format!("{}.5", t0 + 3 + 25_200));
    assert_eq!(fields[8], "1.5");
    assert_eq!(fields[COLUMNS], "0.0");

    let log = fs::read_to_string(&config.state_log_file).unwrap();
    assert_eq!(
        log,
        "ST2_a.LPC.dat.gz: 7 LPC: sampling\nST2_b.LPC.dat.gz: 7 LPC: sampling\n"
    );

    // 2回目は新しいパケットがないので何もしない
    let report = process_directory(&config, &BinLayout::default()).unwrap();
    assert!(report.batch.outcomes.is_empty());
    assert!(report.aggregation.is_none());
}

#[test]
fn failed_packet_does_not_stop_batch() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path();
    write_packet(&dir.join("good1.dat.gz"), 6);
    write_gz(&dir.join("bad.dat.gz"), b"<TM>no binary section</TM>");
    write_gz(&dir.join("short.dat.gz"), &[&b"START"[..], &[0u8; 200][..], &b"END"[..]].concat());
    write_packet(&dir.join("good2.dat.gz"), 6);
    let out = dir.join("csv");
    fs::create_dir(&out).unwrap();

    let jobs: Vec<PacketJob> = ["good1", "bad", "short", "good2"]
        .iter()
        .map(|name| PacketJob {
            input: dir.join(format!("{name}.dat.gz")),
            output: out.join(format!("{name}.csv")),
        })
        .collect();
    let report = convert_packets(&jobs, &LpcConfig::default(), &BinLayout::default());
    assert_eq!(report.converted(), 2);
    assert!(matches!(
        report.outcomes[1].status,
        PacketStatus::Failed(LpcError::FrameNotFound("START"))
    ));
    assert!(matches!(
        report.outcomes[2].status,
        PacketStatus::Failed(LpcError::TruncatedPayload { .. })
    ));
    assert!(matches!(
        report.outcomes[3].status,
        PacketStatus::Converted { rows: 6 }
    ));
    assert_eq!(fs::metadata(out.join("bad.csv")).unwrap().len(), 0);
    assert_eq!(fs::metadata(out.join("short.csv")).unwrap().len(), 0);

    let aggregation = aggregate(
        &glob(&out),
        dir.join("mean.out"),
        dir.join("master.out"),
        &AggregationConfig::default(),
    )
    .unwrap();
    let skipped = aggregation
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Skipped))
        .count();
    assert_eq!(skipped, 2);
    assert_eq!(aggregation.failures().count(), 0);
    assert_eq!(aggregation.master_rows(), 2 * 6);
    assert_eq!(aggregation.mean_rows(), 2);
}

#[test]
fn five_valid_rows_yield_one_mean_row() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("csv");
    fs::create_dir(&dir).unwrap();
    let rows: Vec<String> = (0..5)
        .map(|i| data_line(1000.0 + i as f64, 0.5 + i as f64, 20.0))
        .collect();
    write_csv(&dir.join("a.csv"), &rows);
    write_csv(&dir.join("b.csv"), &[]);
    fs::write(dir.join("c.csv"), b"").unwrap();

    let mean_path = root.path().join("mean.out");
    let report = aggregate(
        &glob(&dir),
        &mean_path,
        root.path().join("master.out"),
        &AggregationConfig::default(),
    )
    .unwrap();
    assert!(matches!(report.files[2].status, FileStatus::Skipped));
    assert_eq!(report.mean_rows(), 1);

    let text = fs::read_to_string(&mean_path).unwrap();
    let lines: Vec<&str> = text.split("\r\n").collect();
    // ヘッダーは2番目のファイルの2行目と3行目
    assert_eq!(lines[0], "Time,b");
    assert_eq!(lines[1], "[Unix Time],b");
    let fields: Vec<&str> = lines[2].split(',').collect();
    assert_eq!(fields.len(), COLUMNS + 1);
    assert_eq!(fields[0], "26202.0");
    assert_eq!(fields[8], "2.5");
    assert_eq!(fields[10], "20.0");
    assert_eq!(fields[COLUMNS], "0.0");
    assert_eq!(lines[3], "");
}

#[test]
fn missing_count_matches_values_below_absolute_zero() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("csv");
    fs::create_dir(&dir).unwrap();
    let mut rows: Vec<String> = (0..6).map(|_| data_line(0.0, 1.0, 10.0)).collect();
    rows[0] = data_line(0.0, 1.0, -273.15);
    rows[1] = data_line(0.0, 1.0, -273.15);
    rows[5] = data_line(0.0, 0.1, -273.15);
    write_csv(&dir.join("a.csv"), &rows);
    write_csv(&dir.join("b.csv"), &rows);

    let mean_path = root.path().join("mean.out");
    let report = aggregate(
        &glob(&dir),
        &mean_path,
        root.path().join("master.out"),
        &AggregationConfig::default(),
    )
    .unwrap();
    assert_eq!(report.mean_rows(), 2);
    for line in data_lines(&mean_path) {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields[10], "10.0");
        assert_eq!(fields[COLUMNS], "3.0");
    }
    // マスターには欠測値も含めてそのまま記録する
    let master = data_lines(&root.path().join("master.out"));
    assert_eq!(master.len(), 12);
    assert!(master[0].contains("-2.731499999999999773e+02"));
}

#[test]
fn malformed_file_is_isolated() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("csv");
    fs::create_dir(&dir).unwrap();
    let good: Vec<String> = (0..4).map(|i| data_line(i as f64, 1.0, 0.0)).collect();
    let mut bad = good.clone();
    bad[2] = "1,2,three".to_string();
    write_csv(&dir.join("a.csv"), &good);
    write_csv(&dir.join("b.csv"), &bad);
    write_csv(&dir.join("c.csv"), &good);

    let master_path = root.path().join("master.out");
    let report = aggregate(
        &glob(&dir),
        root.path().join("mean.out"),
        &master_path,
        &AggregationConfig::default(),
    )
    .unwrap();
    let failures: Vec<(PathBuf, LpcError)> = report
        .failures()
        .map(|(p, e)| (p.to_owned(), e.clone()))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0.ends_with("b.csv"));
    assert!(matches!(failures[0].1, LpcError::MalformedRow { line: 9, .. }));
    assert_eq!(report.mean_rows(), 2);
    assert_eq!(data_lines(&master_path).len(), 8);
}

#[test]
fn repeated_aggregation_appends() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("csv");
    fs::create_dir(&dir).unwrap();
    let rows: Vec<String> = (0..4).map(|i| data_line(i as f64, 1.0, 0.0)).collect();
    write_csv(&dir.join("a.csv"), &rows);
    write_csv(&dir.join("b.csv"), &rows);
    let mean_path = root.path().join("mean.out");
    let master_path = root.path().join("master.out");

    let run = |config: &AggregationConfig| {
        aggregate(&glob(&dir), &mean_path, &master_path, config).unwrap();
    };
    let append = AggregationConfig::default();
    run(&append);
    assert_eq!(data_lines(&master_path).len(), 8);
    run(&append);
    assert_eq!(data_lines(&master_path).len(), 16);
    assert_eq!(data_lines(&mean_path).len(), 4);
    // 追記ではヘッダーを繰り返さない
    for path in [&master_path, &mean_path] {
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("Time,")).count(), 1);
        assert!(text.starts_with("Time,b\r\n[Unix Time],b\r\n"));
    }

    let truncate = AggregationConfig {
        truncate_sinks: true,
        ..AggregationConfig::default()
    };
    run(&truncate);
    assert_eq!(data_lines(&master_path).len(), 8);
    assert_eq!(data_lines(&mean_path).len(), 2);
}
