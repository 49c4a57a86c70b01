use std::path::PathBuf;

use clap::Parser;
use lir_backend::{
    result::{CallTarget, CompilationResult},
    serialize::SerializableGraph,
    target::TargetDescription,
    CompilerOptions, Stats,
};

#[derive(Parser)]
/// Tool for compiling serialized graphs with lir-backend.
struct Args {
    /// Print the input graph and the full compilation result.
    #[clap(short = 'v')]
    verbose: bool,

    /// Annotate the code with one comment per block and instruction.
    #[clap(long)]
    comments: bool,

    /// Disable the constant-load and post-allocation optimizations.
    #[clap(long)]
    no_opt: bool,

    /// Input file containing a bincode-encoded SerializableGraph.
    input: PathBuf,
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let graph: SerializableGraph =
        bincode::deserialize(&input).expect("could not deserialize input file");

    if args.verbose {
        println!("Input graph: {graph:?}");
    }

    let optimize = !args.no_opt;
    let options = CompilerOptions {
        constant_load_optimization: optimize,
        redundant_move_elimination: optimize,
        null_check_folding: optimize,
        control_flow_optimization: optimize,
        verify_allocation: true,
        block_comments: args.comments,
        verbose_log: true,
        ..CompilerOptions::default()
    };
    let output = match lir_backend::compile(&graph, &graph, &TargetDescription::amd64(), &options) {
        Ok(output) => output,
        Err(e) if e.is_bailout() => {
            eprintln!("Compilation bailed out: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            panic!("Compilation failed: {e:#?}");
        }
    };

    print_result(&output.result, args.verbose);
    print_stats(&output.stats);
}

fn print_result(result: &CompilationResult, verbose: bool) {
    print!("Compilation result for {}: {{\n", result.name());
    print!(
        "  code: {} bytes, frame: {} bytes\n",
        result.target_code_size(),
        result.frame_size()
    );
    if verbose {
        for (i, chunk) in result.target_code().chunks(16).enumerate() {
            let bytes: Vec<_> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            print!("    {:04x}: {}\n", i * 16, bytes.join(" "));
        }
    }
    for infopoint in result.infopoints() {
        let call = match &infopoint.call {
            Some(site) => match site.target {
                CallTarget::Method(m) => format!(" call method{}", m.index()),
                CallTarget::Runtime(r) => format!(" call {r:?}"),
            },
            None => String::new(),
        };
        let bci = infopoint
            .debug_info
            .as_ref()
            .map(|info| format!(" bci {}", info.frame.bci))
            .unwrap_or_default();
        print!(
            "  infopoint {:#x}: {:?}{}{}\n",
            infopoint.pc_offset, infopoint.reason, call, bci
        );
    }
    for patch in result.data_patches() {
        print!(
            "  data patch {:#x}: {:?} align {}{}\n",
            patch.pc_offset,
            patch.constant,
            patch.alignment,
            if patch.inlined { " (inlined)" } else { "" }
        );
    }
    for handler in result.exception_handlers() {
        print!(
            "  handler {:#x} -> {:#x}\n",
            handler.pc_offset, handler.handler_pos
        );
    }
    for mark in result.marks() {
        print!("  mark {:#x}: {:?}\n", mark.pc_offset, mark.id);
    }
    if verbose {
        for annotation in result.annotations() {
            print!("  {annotation:?}\n");
        }
    }
    if !result.data_section().is_empty() {
        print!(
            "  data: {} bytes at {:#x}, align {}\n",
            result.data_section().len(),
            result.data_section_offset(),
            result.data_section_alignment()
        );
    }
    print!("}}\n");
}

fn print_stats(stats: &Stats) {
    print!("Stats: {stats:#?}\n");
}
