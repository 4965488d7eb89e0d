//! # 2D Stencil, fork-join-revive style
//!
//! Parallel five-point stencil over a blocked grid. The first iteration
//! creates one ULT per block; every later iteration *revives* the joined
//! ULTs instead of freeing and recreating them, so after warm-up the
//! steady state allocates nothing. Blocks are dealt round-robin across
//! the execution streams' main pools.
//!
//! Run parameters come from `stencil.toml` (see the file next to this
//! crate) or a path given as the first argument; missing keys fall back
//! to the defaults below.

use serde::Deserialize;
use std::time::Instant;

use weft::{Ult, UltAttrs, Xstream};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    num_blocks_x: usize,
    num_blocks_y: usize,
    blocksize: usize,
    num_iters: usize,
    num_xstreams: usize,
    validate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_blocks_x: 8,
            num_blocks_y: 8,
            blocksize: 32,
            num_iters: 20,
            num_xstreams: 4,
            validate: true,
        }
    }
}

fn load_config() -> Config {
    let path = std::env::args().nth(1);
    let candidates = match &path {
        Some(p) => vec![p.clone()],
        None => vec!["stencil.toml".into(), "demos/stencil/stencil.toml".into()],
    };
    for candidate in candidates {
        if let Ok(content) = std::fs::read_to_string(&candidate) {
            match toml::from_str(&content) {
                Ok(config) => return config,
                Err(err) => {
                    eprintln!("{candidate}: {err}");
                    std::process::exit(1);
                }
            }
        }
    }
    if path.is_some() {
        eprintln!("could not read the given config file");
        std::process::exit(1);
    }
    Config::default()
}

/// Grid geometry derived from the config. The grid carries a one-cell
/// halo ring that stays zero.
struct Grid {
    width: usize,
    height: usize,
}

impl Grid {
    fn new(cfg: &Config) -> Grid {
        Grid {
            width: cfg.num_blocks_x * cfg.blocksize + 2,
            height: cfg.num_blocks_y * cfg.blocksize + 2,
        }
    }

    fn idx(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    fn init_values(&self) -> Vec<f64> {
        let mut values = vec![0.0; self.width * self.height];
        for y in 1..self.height - 1 {
            for x in 1..self.width - 1 {
                values[self.idx(x, y)] = ((x * 7 + y * 13) % 10) as f64;
            }
        }
        values
    }
}

/// Raw grid pointers for the block kernels. Each block writes a disjoint
/// region of `new`, so sharing them across ULTs is sound.
#[derive(Clone, Copy)]
struct GridPtr {
    old: *const f64,
    new: *mut f64,
}
unsafe impl Send for GridPtr {}

fn stencil_block(grid: &Grid, ptr: GridPtr, blocksize: usize, bx: usize, by: usize) {
    for y in by * blocksize + 1..(by + 1) * blocksize + 1 {
        for x in bx * blocksize + 1..(bx + 1) * blocksize + 1 {
            unsafe {
                *ptr.new.add(grid.idx(x, y)) = *ptr.old.add(grid.idx(x, y)) * 0.5
                    + (*ptr.old.add(grid.idx(x + 1, y))
                        + *ptr.old.add(grid.idx(x - 1, y))
                        + *ptr.old.add(grid.idx(x, y + 1))
                        + *ptr.old.add(grid.idx(x, y - 1)))
                        * 0.125;
            }
        }
    }
}

fn serial_reference(cfg: &Config, grid: &Grid) -> Vec<f64> {
    let mut old = grid.init_values();
    let mut new = vec![0.0; grid.width * grid.height];
    for _ in 0..cfg.num_iters {
        for by in 0..cfg.num_blocks_y {
            for bx in 0..cfg.num_blocks_x {
                let ptr = GridPtr {
                    old: old.as_ptr(),
                    new: new.as_mut_ptr(),
                };
                stencil_block(grid, ptr, cfg.blocksize, bx, by);
            }
        }
        std::mem::swap(&mut old, &mut new);
    }
    old
}

fn main() {
    env_logger::init();
    let cfg = load_config();
    let grid = Grid::new(&cfg);
    log::info!(
        "stencil: {}x{} blocks of {}x{}, {} iterations on {} ES(es)",
        cfg.num_blocks_x,
        cfg.num_blocks_y,
        cfg.blocksize,
        cfg.blocksize,
        cfg.num_iters,
        cfg.num_xstreams
    );

    weft::init().expect("runtime init failed");

    // The primary ES plus the secondaries, and one main pool each.
    let mut xstreams = vec![Xstream::current().expect("no primary ES")];
    for _ in 1..cfg.num_xstreams.max(1) {
        xstreams.push(Xstream::create(None).expect("ES creation failed"));
    }
    let pools: Vec<_> = xstreams
        .iter()
        .map(|xs| {
            xs.main_pools(1)
                .expect("ES without a main pool")
                .remove(0)
        })
        .collect();

    let mut old = grid.init_values();
    let mut new = vec![0.0; grid.width * grid.height];
    let num_blocks = cfg.num_blocks_x * cfg.num_blocks_y;
    let mut ults: Vec<Ult> = Vec::with_capacity(num_blocks);

    let start = Instant::now();
    let (gref, blocksize) = (&grid, cfg.blocksize);
    for t in 0..cfg.num_iters {
        let ptr = GridPtr {
            old: old.as_ptr(),
            new: new.as_mut_ptr(),
        };
        for by in 0..cfg.num_blocks_y {
            for bx in 0..cfg.num_blocks_x {
                let index = bx + by * cfg.num_blocks_x;
                let pool = &pools[index % pools.len()];
                let width = gref.width;
                let height = gref.height;
                let body = move || {
                    let grid = Grid { width, height };
                    stencil_block(&grid, ptr, blocksize, bx, by);
                };
                if t == 0 {
                    ults.push(
                        Ult::create(pool, body, &UltAttrs::default()).expect("ULT creation failed"),
                    );
                } else {
                    Ult::revive(pool, body, &ults[index]).expect("ULT revive failed");
                }
            }
        }
        for ult in &ults {
            ult.join().expect("join failed");
        }
        std::mem::swap(&mut old, &mut new);
    }
    let elapsed = start.elapsed();

    for ult in &ults {
        ult.free().expect("free failed");
    }
    for xs in xstreams.iter().skip(1) {
        xs.join().expect("ES join failed");
        xs.free().expect("ES free failed");
    }
    weft::finalize().expect("runtime finalize failed");

    println!(
        "computed {} iterations over {} blocks in {:.3} ms",
        cfg.num_iters,
        num_blocks,
        elapsed.as_secs_f64() * 1e3
    );

    if cfg.validate {
        let reference = serial_reference(&cfg, &grid);
        let worst = old
            .iter()
            .zip(&reference)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);
        if worst > 1e-12 {
            eprintln!("validation FAILED: max deviation {worst:e}");
            std::process::exit(1);
        }
        println!("validation succeeded (max deviation {worst:e})");
    }
}
