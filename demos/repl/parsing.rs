use clap::{Parser, ValueEnum};
use clap_num::maybe_hex;

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ReportKind {
    #[default]
    Summary,
    Structured,
    Blocks,
}

#[derive(Parser, Debug)]
#[command(disable_help_flag = true)]
pub enum Command {
    Alloc {
        #[arg(long)]
        name: String,
        #[arg(long, value_parser=maybe_hex::<usize>)]
        len: usize,
        #[arg(long, value_parser=maybe_hex::<usize>)]
        align: Option<usize>,
        #[arg(long)]
        zeroed: bool,
    },
    Realloc {
        #[arg(long, value_parser=maybe_hex::<usize>)]
        addr: usize,
        #[arg(long, value_parser=maybe_hex::<usize>)]
        len: usize,
    },
    Dup {
        #[arg(long, value_parser=maybe_hex::<usize>)]
        addr: usize,
    },
    Rename {
        #[arg(long, value_parser=maybe_hex::<usize>)]
        addr: usize,
        #[arg(long)]
        name: String,
    },
    Overrun {
        #[arg(long, value_parser=maybe_hex::<usize>)]
        addr: usize,
        #[arg(long, default_value_t = 1, value_parser=clap::value_parser!(u8).range(1..=4))]
        bytes: u8,
    },
    Free {
        #[arg(long, value_parser=maybe_hex::<usize>)]
        addr: usize,
    },
    Check,
    Report {
        #[arg(long, default_value = "summary")]
        kind: ReportKind,
    },
    Leaks,

    Exit,
}
