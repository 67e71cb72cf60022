//! Blocked matrix multiplication expressed as a task/resource graph: one
//! resource per output tile, with every inner-dimension tile contributing a
//! task that accumulates into it under that resource's lock.
//!
//! Matrix generation is a fixed deterministic sequence rather than a true
//! RNG, and the tile grid, thread count, and queue depth are fixed rather
//! than read from the command line or timed across repeated runs — this is
//! a demonstration of the scheduler, not a benchmark harness.

use anyhow::{Context, Result};
use scheduling::Scheduler;
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};
use thread::ThreadPoolExecutor;

/// Width and height of a single matrix tile.
const TILE: usize = 4;

#[derive(Clone)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Arc<Mutex<Vec<f64>>>,
}

impl Matrix {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: Arc::new(Mutex::new(vec![0.0; rows * cols])),
        }
    }

    /// Fills the matrix with a fixed deterministic sequence derived from
    /// `seed`, standing in for the random matrices the original benchmark
    /// generated at each iteration.
    fn filled(rows: usize, cols: usize, seed: u64) -> Self {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        let data = (0..rows * cols)
            .map(|_| {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                ((state >> 33) as f64 / u32::MAX as f64) - 0.5
            })
            .collect();
        Self {
            rows,
            cols,
            data: Arc::new(Mutex::new(data)),
        }
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self.data.lock().unwrap()[row * self.cols + col]
    }

    fn add_at(&self, row: usize, col: usize, value: f64) {
        self.data.lock().unwrap()[row * self.cols + col] += value;
    }
}

/// Multiplies the tile of `a` at `(tile_row, tile_k)` with the tile of `b`
/// at `(tile_k, tile_col)`, accumulating the product into the tile of `c`
/// at `(tile_row, tile_col)`.
fn multiply_tile(a: &Matrix, b: &Matrix, c: &Matrix, tile_row: usize, tile_k: usize, tile_col: usize) {
    for i in 0..TILE {
        for j in 0..TILE {
            let mut acc = 0.0;
            for k in 0..TILE {
                acc += a.get(tile_row * TILE + i, tile_k * TILE + k) * b.get(tile_k * TILE + k, tile_col * TILE + j);
            }
            c.add_at(tile_row * TILE + i, tile_col * TILE + j, acc);
        }
    }
}

/// Builds one resource per `(m, k)` output tile and one task per `n` inner
/// tile contributing to it, then runs the whole graph to completion.
fn multiply(a: &Matrix, b: &Matrix, c: &Matrix, m_tiles: usize, n_tiles: usize, k_tiles: usize) -> Result<()> {
    let mut scheduler = Scheduler::new(ThreadPoolExecutor::new(
        NonZeroUsize::new(4).unwrap(),
        NonZeroUsize::new(256).unwrap(),
    ));

    for tile_row in 0..m_tiles {
        for tile_col in 0..k_tiles {
            let resource = scheduler.add_resource()?;
            for tile_k in 0..n_tiles {
                let a = a.clone();
                let b = b.clone();
                let c = c.clone();
                let task = scheduler.add_task(move || {
                    multiply_tile(&a, &b, &c, tile_row, tile_k, tile_col);
                    Ok(())
                })?;
                scheduler.add_required_resource(task, resource)?;
            }
        }
    }

    scheduler
        .run()
        .context("failed to start matmul run")?
        .wait()
        .map_err(|errors| anyhow::anyhow!("{errors}"))
}

fn main() -> Result<()> {
    env_logger::init();

    let (m_tiles, n_tiles, k_tiles) = (2, 3, 2);
    let a = Matrix::filled(m_tiles * TILE, n_tiles * TILE, 1);
    let b = Matrix::filled(n_tiles * TILE, k_tiles * TILE, 2);
    let c = Matrix::zeros(m_tiles * TILE, k_tiles * TILE);

    multiply(&a, &b, &c, m_tiles, n_tiles, k_tiles)?;

    let result = c.data.lock().unwrap();
    log::info!("c[0][0] = {:.4}, c[{}][{}] = {:.4}", result[0], c.rows - 1, c.cols - 1, result[result.len() - 1]);
    println!("{}x{} result tile grid computed, c[0][0] = {:.4}", m_tiles, k_tiles, result[0]);
    Ok(())
}
