//! WASM execution sandbox.
//!
//! Wasmtime with fuel metering, epoch-based wall-clock interruption, and a
//! store memory limit. No WASI and no host imports beyond an `abort` shim,
//! so guest code has no filesystem, network, process or environment access.
//!
//! Guest ABI: the module exports a linear `memory`, an `alloc(len) -> ptr`
//! bump allocator, and the task's entry function `(ptr, len) -> i64` whose
//! return packs the result as `ptr << 32 | len`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};

use crate::error::ComputeError;

/// Epoch tick granularity for wall-clock enforcement.
const EPOCH_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub struct SandboxLimits {
    pub fuel: u64,
    pub memory_bytes: usize,
    pub wall_clock: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            fuel: 100_000_000,
            memory_bytes: 64 << 20,
            wall_clock: Duration::from_secs(30),
        }
    }
}

pub struct SandboxOutput {
    pub bytes: Vec<u8>,
    pub elapsed: Duration,
    pub fuel_used: u64,
}

struct StoreCtx {
    limits: StoreLimits,
}

/// Reusable engine plus per-execution limits. Cloning shares the compiled
/// engine.
#[derive(Clone)]
pub struct Sandbox {
    engine: Engine,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Result<Self, ComputeError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        // Deterministic execution: no threads, no SIMD.
        config.wasm_threads(false);
        config.wasm_simd(false);
        config.wasm_bulk_memory(true);
        config.wasm_multi_value(true);
        let engine = Engine::new(&config).map_err(|e| ComputeError::InvalidModule(e.to_string()))?;
        Ok(Sandbox { engine, limits })
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Compiles and runs `function` from `wasm` over `input`.
    ///
    /// Traps are caught and mapped: fuel exhaustion to `GasExhausted`, an
    /// epoch interrupt (wall clock, including infinite loops) to
    /// `DeadlineExceeded`, everything else to `Trapped`.
    pub fn execute(
        &self,
        wasm: &[u8],
        function: &str,
        input: &[u8],
        wall_clock: Option<Duration>,
    ) -> Result<SandboxOutput, ComputeError> {
        let started = Instant::now();
        let wall_clock = wall_clock.unwrap_or(self.limits.wall_clock);

        let module = Module::new(&self.engine, wasm)
            .map_err(|e| ComputeError::InvalidModule(e.to_string()))?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.limits.memory_bytes)
            .instances(1)
            .build();
        let mut store = Store::new(&self.engine, StoreCtx { limits });
        store.limiter(|ctx| &mut ctx.limits);
        store
            .set_fuel(self.limits.fuel)
            .map_err(|e| ComputeError::InvalidModule(e.to_string()))?;

        let ticks = (wall_clock.as_millis() / EPOCH_TICK.as_millis()).max(1) as u64;
        store.set_epoch_deadline(ticks);
        let ticker = EpochTicker::spawn(self.engine.clone());

        let mut linker: Linker<StoreCtx> = Linker::new(&self.engine);
        linker
            .func_wrap("env", "abort", |_: i32, _: i32, _: i32, _: i32| {})
            .map_err(|e| ComputeError::InvalidModule(e.to_string()))?;

        let result = self.run_instance(&mut store, &linker, &module, function, input);
        drop(ticker);

        let fuel_left = store.get_fuel().unwrap_or(0);
        let output = result.map_err(map_wasm_error)?;
        let elapsed = started.elapsed();
        debug!(
            function,
            out_len = output.len(),
            ?elapsed,
            fuel_used = self.limits.fuel - fuel_left,
            "sandbox execution finished"
        );
        Ok(SandboxOutput {
            bytes: output,
            elapsed,
            fuel_used: self.limits.fuel - fuel_left,
        })
    }

    fn run_instance(
        &self,
        store: &mut Store<StoreCtx>,
        linker: &Linker<StoreCtx>,
        module: &Module,
        function: &str,
        input: &[u8],
    ) -> Result<Vec<u8>, wasmtime::Error> {
        let instance = linker.instantiate(&mut *store, module)?;
        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| wasmtime::Error::msg("module exports no memory"))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
        let entry = instance.get_typed_func::<(i32, i32), i64>(&mut *store, function)?;

        let in_ptr = alloc.call(&mut *store, input.len() as i32)?;
        memory.write(&mut *store, in_ptr as usize, input)?;

        let packed = entry.call(&mut *store, (in_ptr, input.len() as i32))?;
        let out_ptr = (packed >> 32) as u32 as usize;
        let out_len = packed as u32 as usize;

        let mem_size = memory.data_size(&*store);
        if out_ptr.checked_add(out_len).map_or(true, |end| end > mem_size) {
            return Err(wasmtime::Error::msg("result range outside guest memory"));
        }
        let mut out = vec![0u8; out_len];
        memory.read(&*store, out_ptr, &mut out)?;
        Ok(out)
    }
}

fn map_wasm_error(err: wasmtime::Error) -> ComputeError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => ComputeError::GasExhausted,
        Some(Trap::Interrupt) => ComputeError::DeadlineExceeded,
        Some(trap) => ComputeError::Trapped(trap.to_string()),
        None => ComputeError::Trapped(err.to_string()),
    }
}

/// Advances the engine epoch on a fixed cadence until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn spawn(engine: Engine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(EPOCH_TICK);
                engine.increment_epoch();
            }
        });
        EpochTicker { stop }
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bump allocator, an echo entry, a trapping entry, and a spin loop.
    const GUEST: &str = r#"
        (module
          (memory (export "memory") 16)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "alloc") (param $n i32) (result i32)
            (local $p i32)
            global.get $heap
            local.set $p
            global.get $heap
            local.get $n
            i32.add
            global.set $heap
            local.get $p)
          (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
            local.get $ptr
            i64.extend_i32_u
            i64.const 32
            i64.shl
            local.get $len
            i64.extend_i32_u
            i64.or)
          (func (export "boom") (param i32 i32) (result i64)
            unreachable)
          (func (export "spin") (param i32 i32) (result i64)
            (loop $l (br $l))
            unreachable))
    "#;

    fn sandbox(limits: SandboxLimits) -> Sandbox {
        Sandbox::new(limits).expect("engine builds")
    }

    #[test]
    fn echo_round_trips_input() {
        let sb = sandbox(SandboxLimits::default());
        let out = sb
            .execute(GUEST.as_bytes(), "echo", b"sandboxed payload", None)
            .expect("execution succeeds");
        assert_eq!(out.bytes, b"sandboxed payload");
        assert!(out.fuel_used > 0);
    }

    #[test]
    fn trap_is_caught() {
        let sb = sandbox(SandboxLimits::default());
        let err = sb
            .execute(GUEST.as_bytes(), "boom", b"x", None)
            .expect_err("trap expected");
        assert!(matches!(err, ComputeError::Trapped(_)));
    }

    #[test]
    fn infinite_loop_hits_gas_limit() {
        let sb = sandbox(SandboxLimits {
            fuel: 100_000,
            ..Default::default()
        });
        let err = sb
            .execute(GUEST.as_bytes(), "spin", b"x", None)
            .expect_err("must stop");
        assert!(matches!(err, ComputeError::GasExhausted));
    }

    #[test]
    fn infinite_loop_hits_wall_clock_with_ample_fuel() {
        let sb = sandbox(SandboxLimits {
            fuel: u64::MAX / 2,
            wall_clock: Duration::from_millis(50),
            ..Default::default()
        });
        let started = Instant::now();
        let err = sb
            .execute(GUEST.as_bytes(), "spin", b"x", None)
            .expect_err("must stop");
        assert!(matches!(err, ComputeError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_entry_function_is_invalid() {
        let sb = sandbox(SandboxLimits::default());
        let err = sb
            .execute(GUEST.as_bytes(), "nope", b"x", None)
            .expect_err("unknown export");
        assert!(matches!(err, ComputeError::Trapped(_)));
    }

    #[test]
    fn garbage_module_rejected() {
        let sb = sandbox(SandboxLimits::default());
        let err = sb
            .execute(b"not wasm at all", "echo", b"x", None)
            .expect_err("invalid module");
        assert!(matches!(err, ComputeError::InvalidModule(_)));
    }
}
