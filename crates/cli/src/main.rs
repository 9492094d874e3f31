use clap::{Parser, Subcommand};
use quantum_core::config;
use quantum_core::hnsw::BuildOptions;
use quantum_core::storage::{FileRegion, KvRegion, MemoryRegion, WriteBatch};
use quantum_core::{HnswIndex, IndexOptions, RowId, SearchOptions, SessionSettings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::Read as _;
use std::path::Path;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quantum-hnsw", about = "HNSW approximate nearest neighbor index")]
struct Args {
    /// Directory holding the index region log
    #[arg(short, long, default_value = config::DEFAULT_DATA_DIR)]
    data_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the index if needed and add vectors to it
    Build {
        /// Index options, e.g. "dims=128, m=16, efbuild=64, algorithm=cosine"
        #[arg(long)]
        options: Option<String>,

        /// Vector file: u32 count, u32 dims, then count x dims little-endian f32
        #[arg(long, conflicts_with = "random")]
        input: Option<String>,

        /// Generate this many uniformly random vectors instead of reading a file
        #[arg(long)]
        random: Option<usize>,

        /// Worker threads for the build
        #[arg(long, default_value_t = config::DEFAULT_INDEX_PARALLEL)]
        index_parallel: usize,

        /// Seed for layer sampling and random vectors
        #[arg(long)]
        seed: Option<u64>,

        /// Row id assigned to the first vector; later vectors count up from it
        #[arg(long, default_value_t = 0)]
        first_row: u64,
    },
    /// Print the k nearest rows to a query as JSON lines
    Search {
        /// Comma-separated query components
        #[arg(long, allow_hyphen_values = true)]
        query: String,

        #[arg(short, long, default_value_t = 10)]
        k: usize,

        /// Candidate list size (defaults to the index's efsearch)
        #[arg(long)]
        ef: Option<usize>,

        /// Drop results farther than this distance
        #[arg(long)]
        max_distance: Option<f32>,
    },
    /// Print index statistics as JSON
    Stats,
    /// Tombstone rows
    Delete {
        #[arg(long = "row", required = true)]
        rows: Vec<u64>,
    },
    /// Report dead tuples, optionally rebuilding without them
    Vacuum {
        /// Rebuild the graph from live rows and rewrite the region
        #[arg(long, default_value_t = false)]
        compact: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("quantum_cli=info".parse().expect("valid directive literal"))
                .add_directive("quantum_core=info".parse().expect("valid directive literal")),
        )
        .init();

    let args = Args::parse();
    let data_path = Path::new(&args.data_dir);
    if data_path.exists() && !data_path.is_dir() {
        eprintln!(
            "Error: data_dir '{}' exists but is not a directory",
            args.data_dir
        );
        std::process::exit(1);
    }
    let mut region = FileRegion::open(data_path)?;
    let replay = region.replay_stats();
    if replay.crc_errors > 0 || replay.truncated {
        tracing::warn!(
            crc_errors = replay.crc_errors,
            truncated = replay.truncated,
            "region log was damaged; recovered the intact prefix"
        );
    }

    match args.command {
        Command::Build {
            options,
            input,
            random,
            index_parallel,
            seed,
            first_row,
        } => {
            let index = open_or_create(&region, options.as_deref(), seed)?;
            let vectors = match (input, random) {
                (Some(path), _) => read_fvecs(Path::new(&path))?,
                (None, Some(n)) => {
                    random_vectors(n, index.dims(), seed.unwrap_or(index.options().seed))
                }
                (None, None) => {
                    eprintln!("Error: build needs --input or --random");
                    std::process::exit(2);
                }
            };
            let rows = vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| (RowId(first_row + i as u64), v));

            let mut settings = SessionSettings::default();
            settings.set("quantum.index_parallel", &index_parallel.to_string())?;
            let mut build = BuildOptions::from(&settings);
            if let Some(seed) = seed {
                build = build.with_seed(seed);
            }
            let report = index.build_with(rows, &build);
            // persist committed nodes even when the build stopped early
            let flushed = index.flush_to(&mut region)?;
            let report = report?;
            println!(
                "{}",
                serde_json::json!({ "build": report, "flush": flushed })
            );
        }
        Command::Search {
            query,
            k,
            ef,
            max_distance,
        } => {
            let index = HnswIndex::load_from(&region)?;
            let query = parse_vector(&query)?;
            let mut opts = SearchOptions::new(k);
            if let Some(ef) = ef {
                opts = opts.with_ef(ef);
            }
            if let Some(d) = max_distance {
                opts = opts.with_max_distance(d);
            }
            for hit in index.search_with(&query, &opts)? {
                println!("{}", serde_json::to_string(&hit)?);
            }
        }
        Command::Stats => {
            let index = HnswIndex::load_from(&region)?;
            let out = serde_json::json!({
                "index": index.stats(),
                "vacuum": index.vacuum_stats(),
                "region_keys": region.len(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Delete { rows } => {
            let index = HnswIndex::load_from(&region)?;
            let mut deleted = 0usize;
            for row in &rows {
                if index.mark_deleted(RowId(*row)) {
                    deleted += 1;
                } else {
                    tracing::warn!(row, "row not found in index");
                }
            }
            let flushed = index.flush_to(&mut region)?;
            println!(
                "{}",
                serde_json::json!({ "deleted": deleted, "flush": flushed })
            );
        }
        Command::Vacuum { compact } => {
            let index = HnswIndex::load_from(&region)?;
            let before = index.vacuum_stats();
            if !compact {
                println!("{}", serde_json::json!({ "vacuum": before }));
                return Ok(());
            }
            let (fresh, stats) = index.compact()?;
            replace_contents(&mut region, &fresh)?;
            let bytes = region.compact()?;
            println!(
                "{}",
                serde_json::json!({
                    "vacuum": before,
                    "compaction": stats,
                    "region_bytes": bytes,
                })
            );
        }
    }
    Ok(())
}

/// Load the index stored in `region`, or create one from `options` if the region is empty.
fn open_or_create(
    region: &FileRegion,
    options: Option<&str>,
    seed: Option<u64>,
) -> Result<HnswIndex, Box<dyn std::error::Error>> {
    if !region.is_empty() {
        if options.is_some() {
            tracing::info!("index exists; ignoring --options and resuming");
        }
        return Ok(HnswIndex::load_from(region)?);
    }
    let Some(options) = options else {
        return Err("no index in data_dir; pass --options to create one".into());
    };
    let mut parsed = IndexOptions::parse(options)?;
    if let Some(seed) = seed {
        parsed = parsed.with_seed(seed);
    }
    tracing::info!(
        dims = parsed.dims,
        m = parsed.m,
        ef_build = parsed.ef_build,
        metric = %parsed.metric,
        "creating index"
    );
    Ok(HnswIndex::new(parsed)?)
}

/// Replace every record in `region` with the records of `index`, in one batch.
fn replace_contents(
    region: &mut FileRegion,
    index: &HnswIndex,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut staged = MemoryRegion::new();
    index.flush_to(&mut staged)?;
    let fresh = staged.scan_prefix(&[])?;

    let mut batch = WriteBatch::new();
    for (key, _) in region.scan_prefix(&[])? {
        if staged.get(&key)?.is_none() {
            batch.delete(key);
        }
    }
    for (key, value) in fresh {
        batch.put(key, value);
    }
    region.apply(batch)?;
    Ok(())
}

fn parse_vector(s: &str) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    s.split(',')
        .map(|x| {
            x.trim()
                .parse::<f32>()
                .map_err(|e| -> Box<dyn std::error::Error> {
                    format!("bad query component '{}': {e}", x.trim()).into()
                })
        })
        .collect()
}

fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

fn read_fvecs(path: &Path) -> Result<Vec<Vec<f32>>, Box<dyn std::error::Error>> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    if buf.len() < 8 {
        return Err(format!("{}: missing count/dims header", path.display()).into());
    }
    let count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let dims = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let data = &buf[8..];
    if data.len() != count * dims * 4 {
        return Err(format!(
            "{}: expected {} bytes of vectors for {count} x {dims}, found {}",
            path.display(),
            count * dims * 4,
            data.len()
        )
        .into());
    }
    let vectors = data
        .chunks_exact(dims.max(1) * 4)
        .take(count)
        .map(|row| {
            row.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect();
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("1, -2.5,3").unwrap(), vec![1.0, -2.5, 3.0]);
        assert!(parse_vector("1,x").is_err());
    }

    #[test]
    fn test_read_fvecs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.bin");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        for x in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();
        let vectors = read_fvecs(&path).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);

        std::fs::write(&path, &bytes[..20]).unwrap();
        assert!(read_fvecs(&path).is_err());
    }

    #[test]
    fn test_replace_contents_drops_stale_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = FileRegion::open(dir.path()).unwrap();
        let index = HnswIndex::new(IndexOptions::new(2).with_m(2).with_ef_build(4)).unwrap();
        for i in 0..10u64 {
            index.insert(RowId(i), &[i as f32, 0.0]).unwrap();
        }
        index.flush_to(&mut region).unwrap();
        index.bulk_delete(|row| row.0 >= 5);
        let (fresh, _) = index.compact().unwrap();
        replace_contents(&mut region, &fresh).unwrap();

        let loaded = HnswIndex::load_from(&region).unwrap();
        assert_eq!(loaded.node_count(), 5);
        assert_eq!(loaded.deleted_count(), 0);
        assert!(region.get(&[b'V', 0, 0, 0, 9]).unwrap().is_none());
    }
}
