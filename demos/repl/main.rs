//! An interactive shell over a guarded allocator. Blocks are referred to by
//! address, as printed when they are allocated.

use std::{collections::HashMap, sync::Mutex};

use clap::Parser;
use guardalloc::{Block, Config, Error, Guarded, MemAllocator, System};
use linefeed::{Interface, ReadResult};

use crate::parsing::{Command, ReportKind};

mod parsing;

type Allocator = Guarded<System, Mutex<()>>;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let interface = Interface::new("guardalloc-repl")?;
    interface.set_prompt("[∴] ")?;

    let allocator = Allocator::with_config(System, Config::new().debug_fill(true));
    let mut blocks: HashMap<usize, Block<Allocator>> = HashMap::new();

    while let ReadResult::Input(command) = interface.read_line()? {
        match Command::try_parse_from(["[∴]"].into_iter().chain(command.split(' '))) {
            Ok(Command::Exit) => break,
            Ok(Command::Alloc {
                name,
                len,
                align,
                zeroed,
            }) => {
                let name: &'static str = name.leak();
                let result = match (align, zeroed) {
                    (Some(align), _) => allocator.allocate_aligned(len, align, name),
                    (None, true) => allocator.allocate_zeroed(len, name),
                    (None, false) => allocator.allocate(len, name),
                };
                match result {
                    Ok(block) => {
                        println!("Allocated {len:#x} bytes for {name:?} at {block:p}");
                        blocks.insert(block.addr(), block);
                    }
                    Err(Error::InvalidAlignment) => {
                        println!("The alignment must be a power of two below 1024!");
                    }
                    Err(e) => println!("Allocation failed: {e}"),
                }
            }
            Ok(Command::Realloc { addr, len }) => match blocks.remove(&addr) {
                Some(block) => match unsafe { allocator.reallocate(Some(block), len, "") } {
                    Ok(new) => {
                        println!("Moved {addr:#x} to {new:p}");
                        blocks.insert(new.addr(), new);
                    }
                    Err(e) => {
                        println!("Reallocation failed: {e}");
                        blocks.insert(addr, block);
                    }
                },
                None => println!("There is no block at {addr:#x} :("),
            },
            Ok(Command::Dup { addr }) => match blocks.get(&addr) {
                Some(&block) => match unsafe { allocator.duplicate(block) } {
                    Ok(copy) => {
                        println!(
                            "Copied {addr:#x} to {copy:p} as {:?}",
                            unsafe { allocator.name(Some(copy)) }
                        );
                        blocks.insert(copy.addr(), copy);
                    }
                    Err(e) => println!("Duplication failed: {e}"),
                },
                None => println!("There is no block at {addr:#x} :("),
            },
            Ok(Command::Rename { addr, name }) => match blocks.get(&addr) {
                Some(&block) => {
                    unsafe { allocator.set_name(block, name.leak()) };
                    println!("Renamed {addr:#x}");
                }
                None => println!("There is no block at {addr:#x} :("),
            },
            Ok(Command::Overrun { addr, bytes }) => match blocks.get(&addr) {
                Some(&block) => {
                    let len = unsafe { allocator.allocation_len(Some(block)) };
                    // at most 4 bytes, the size of the trailer tag
                    unsafe { block.as_ptr().add(len).write_bytes(0, bytes as usize) };
                    println!("Wrote {bytes} bytes past the end of {addr:#x}");
                }
                None => println!("There is no block at {addr:#x} :("),
            },
            Ok(Command::Free { addr }) => match blocks.remove(&addr) {
                Some(block) => match unsafe { allocator.free(Some(block)) } {
                    Ok(()) => println!("Freed {addr:#x}"),
                    Err(e) => println!("Free reported: {e}"),
                },
                None => println!("There is no block at {addr:#x} :("),
            },
            Ok(Command::Check) => {
                if allocator.consistency_check() {
                    println!("All {} blocks are intact", allocator.block_count());
                } else {
                    println!("At least one block is corrupt!");
                }
            }
            Ok(Command::Report { kind }) => match kind {
                ReportKind::Summary => allocator.print_report(),
                ReportKind::Structured => allocator.print_report_structured(),
                ReportKind::Blocks => allocator.print_blocks(),
            },
            Ok(Command::Leaks) => {
                let leaked = allocator.report_leaks();
                println!("{leaked} blocks are live");
            }
            Err(err) => {
                println!();
                err.print()?;
                println!();
                continue;
            }
        }
    }

    for (_, block) in blocks {
        let _ = unsafe { allocator.free(Some(block)) };
    }

    Ok(())
}
