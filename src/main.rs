use anyhow::{ensure, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;

use contig_forge::config::AssemblerConfig;
use contig_forge::contigging::contigging;
use contig_forge::contigs::Contigs;
use contig_forge::fabric::run_spmd;
use contig_forge::reads::{PackedRead, PackedReads};
use contig_forge::{shuffle, utils};

#[derive(Parser, Debug)]
#[command(name = "contig-forge", version, about = "Iterative de Bruijn graph contigging engine")]
struct Cli {
    /// Input read files: R1/R2 pairs when an even count, interleaved otherwise
    #[arg(short, long, required = true, num_args = 1..)]
    reads: Vec<PathBuf>,

    /// Ascending k-mer lengths, one contigging round each
    #[arg(short, long, value_delimiter = ',', default_values_t = vec![21, 33, 55, 77, 99])]
    kmer_lens: Vec<usize>,

    /// Phred quality offset (33 or 64)
    #[arg(long, default_value_t = 33)]
    qual_offset: u8,

    /// Minimum k-mer depth for consensus
    #[arg(long, default_value_t = 2)]
    dmin_thres: u16,

    /// Per-rank aggregation buffer cap in MB
    #[arg(long, default_value_t = 50)]
    max_kmer_store_mb: usize,

    /// Bound on outstanding cross-rank requests
    #[arg(long, default_value_t = 100)]
    max_rpcs_in_flight: usize,

    /// Combine repeated hot k-mer updates before routing
    #[arg(long)]
    use_heavy_hitters: bool,

    /// Defer singleton k-mers until a second sighting (needs dmin >= 2)
    #[arg(long)]
    use_qf: bool,

    /// Dump contigs-<k>.fasta after every round
    #[arg(long)]
    checkpoint: bool,

    /// Resume from a previously dumped contig FASTA
    #[arg(long)]
    ctgs: Option<String>,

    /// Minimum contig length in the final assembly
    #[arg(long, default_value_t = 500)]
    min_ctg_print_len: usize,

    /// Relocate read pairs to the rank owning their best contig
    #[arg(long)]
    shuffle_reads: bool,

    /// Number of SPMD ranks
    #[arg(long, default_value_t = num_cpus::get())]
    ranks: usize,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// JSON config file; overrides all other options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<(AssemblerConfig, Vec<PathBuf>)> {
        let Cli {
            reads,
            kmer_lens,
            qual_offset,
            dmin_thres,
            max_kmer_store_mb,
            max_rpcs_in_flight,
            use_heavy_hitters,
            use_qf,
            checkpoint,
            ctgs,
            min_ctg_print_len,
            shuffle_reads,
            ranks,
            output_dir,
            config,
            verbose: _,
        } = self;
        let cfg = match config {
            Some(path) => AssemblerConfig::from_json(&path)?,
            None => AssemblerConfig {
                kmer_lens,
                qual_offset,
                dmin_thres,
                max_kmer_store_mb,
                max_rpcs_in_flight,
                use_heavy_hitters,
                use_qf,
                checkpoint,
                ctgs_fname: ctgs,
                min_ctg_print_len,
                shuffle_reads,
                ranks: ranks.max(1),
                output_dir,
            },
        };
        cfg.validate()?;
        Ok((cfg, reads))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .init();

    let (cfg, read_files) = cli.into_config()?;
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("could not create output dir {}", cfg.output_dir.display()))?;

    println!("🧬 ContigForge - Iterative Contigging Engine");
    println!("============================================");
    println!("Ranks: {}", cfg.ranks);
    println!("K-mer rounds: {:?}", cfg.kmer_lens);
    println!("Input files: {}\n", read_files.len());

    // ingest and pack the reads, then deal pairs round-robin across ranks
    let packed = utils::load_read_pairs(&read_files, cfg.qual_offset)?;
    ensure!(!packed.is_empty(), "no reads found in input files");
    let mut per_rank: Vec<Vec<PackedRead>> = (0..cfg.ranks).map(|_| Vec::new()).collect();
    for (pair_idx, pair) in packed.chunks(2).enumerate() {
        per_rank[pair_idx % cfg.ranks].extend_from_slice(pair);
    }
    let banks: Vec<Mutex<Option<PackedReads>>> = per_rank
        .into_iter()
        .map(|reads| Mutex::new(Some(PackedReads::from_reads(cfg.qual_offset, reads))))
        .collect();

    run_spmd(cfg.ranks, |ctx| {
        let mut reads = banks[ctx.rank_me()]
            .lock()
            .take()
            .expect("each rank takes its bank exactly once");
        reads.report_balance(&ctx, "Loaded reads")?;
        let mut ctgs = Contigs::new();
        if let Some(fname) = &cfg.ctgs_fname {
            ctgs.load(&ctx, std::path::Path::new(fname))?;
        }
        contigging(&ctx, &cfg, &mut reads, &mut ctgs)?;
        if cfg.shuffle_reads {
            shuffle::shuffle_reads(&ctx, &mut reads, &ctgs)?;
        }
        ctgs.dump(&ctx, &cfg.output_path("final_assembly.fasta"), cfg.min_ctg_print_len)?;
        ctgs.print_stats(&ctx, cfg.min_ctg_print_len)?;
        Ok(())
    })?;

    println!("\n✅ Assembly complete: {}", cfg.output_path("final_assembly.fasta").display());
    Ok(())
}
