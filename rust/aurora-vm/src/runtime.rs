//! Round-robin scheduler for Aurora processes.
//!
//! Each tick runs one instruction of the process at the head of the pool and
//! rotates it to the back. A process that calls an asynchronous native is
//! parked outside the pool while its job runs on a worker thread; the job
//! posts its result on a channel and the scheduler re-enqueues the process
//! when the completion is drained. When every live process is parked the
//! scheduler blocks on that channel.

use crate::natives::{NativeError, NativeOutput, NativeRegistry};
use crate::vm::{Process, ProcessState, VmError};
use aurora_compiler::compiler::ail::Program;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info};

/// Per-process execution limits and switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fail a process after this many instructions.
    pub max_steps: Option<u64>,
    /// Collect garbage once this many run-time objects are live. `None`
    /// disables collection.
    pub gc_threshold: Option<usize>,
    pub trace_instructions: bool,
    /// Where `fork` looks for module files.
    pub search_path: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { max_steps: None, gc_threshold: Some(50_000), trace_instructions: false, search_path: Vec::new() }
    }
}

/// Destination for `display` and `newline`.
pub trait OutputSink: Send {
    fn write_str(&mut self, text: &str);
    fn flush(&mut self) {}
}

#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_str(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        // stdout going away mid-run is not a process error
        let _ = out.write_all(text.as_bytes());
    }

    fn flush(&mut self) {
        let _ = std::io::stdout().flush();
    }
}

/// Collects output in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    buffer: Arc<Mutex<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl OutputSink for BufferSink {
    fn write_str(&mut self, text: &str) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push_str(text);
        }
    }
}

/// How one process ended.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub pid: u64,
    pub state: ProcessState,
    pub steps: u64,
    pub peak_call_depth: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub processes: Vec<ProcessReport>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &ProcessReport> {
        self.processes.iter().filter(|p| p.state == ProcessState::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn process(&self, pid: u64) -> Option<&ProcessReport> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}

struct Completion {
    pid: u64,
    result: Result<NativeOutput, NativeError>,
}

pub struct Runtime {
    config: RuntimeConfig,
    natives: Arc<NativeRegistry>,
    pool: VecDeque<Process>,
    sleeping: HashMap<u64, Process>,
    completions: (Sender<Completion>, Receiver<Completion>),
    next_pid: u64,
    sink: Box<dyn OutputSink>,
    reports: Vec<ProcessReport>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            natives: Arc::new(NativeRegistry::with_builtins()),
            pool: VecDeque::new(),
            sleeping: HashMap::new(),
            completions: unbounded(),
            next_pid: 1,
            sink: Box::new(StdoutSink),
            reports: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_natives(mut self, natives: NativeRegistry) -> Self {
        self.natives = Arc::new(natives);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Add a program to the pool as a new process. Returns its pid.
    pub fn spawn(&mut self, program: Program) -> Result<u64, VmError> {
        let process = Process::new(0, Arc::new(program), self.config.clone(), Arc::clone(&self.natives))?;
        Ok(self.admit(process))
    }

    fn admit(&mut self, mut process: Process) -> u64 {
        let pid = self.next_pid;
        self.next_pid += 1;
        process.set_pid(pid);
        info!(pid, "process spawned");
        self.pool.push_back(process);
        pid
    }

    /// Number of processes not yet terminated.
    pub fn live(&self) -> usize {
        self.pool.len() + self.sleeping.len()
    }

    /// Run until every process has terminated.
    pub fn run(&mut self) -> RunReport {
        while self.live() > 0 {
            if self.pool.is_empty() {
                // everyone is waiting on native I/O
                match self.completions.1.recv() {
                    Ok(completion) => self.wake(completion),
                    Err(_) => break,
                }
                continue;
            }
            self.tick();
        }
        self.sink.flush();
        RunReport { processes: std::mem::take(&mut self.reports) }
    }

    /// Drain finished native jobs, then run one instruction of the process
    /// at the head of the pool.
    pub fn tick(&mut self) {
        while let Ok(completion) = self.completions.1.try_recv() {
            self.wake(completion);
        }
        let Some(mut process) = self.pool.pop_front() else { return };

        let outcome = process.execute(self.sink.as_mut());
        let parent = process.pid();
        let children = process.take_spawned();

        match outcome {
            Err(err) => self.retire(process, Some(err)),
            Ok(()) => match process.state() {
                ProcessState::Running | ProcessState::Suspended => self.pool.push_back(process),
                ProcessState::Sleeping => self.park(process),
                ProcessState::Stopped | ProcessState::Failed => self.retire(process, None),
            },
        }
        for child in children {
            let pid = self.admit(child);
            debug!(parent, child = pid, "fork");
        }
    }

    fn park(&mut self, mut process: Process) {
        let pid = process.pid();
        let Some(job) = process.take_pending() else {
            let err = VmError::InvalidProgram("sleeping without a pending native call".into());
            self.retire(process, Some(err));
            return;
        };
        debug!(pid, "process sleeping");
        let sender = self.completions.0.clone();
        thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(NativeError::Panicked(message))
            });
            let _ = sender.send(Completion { pid, result });
        });
        self.sleeping.insert(pid, process);
    }

    fn wake(&mut self, completion: Completion) {
        let Some(mut process) = self.sleeping.remove(&completion.pid) else { return };
        debug!(pid = completion.pid, "process woken");
        match process.complete_native(completion.result) {
            Ok(()) => self.pool.push_back(process),
            Err(err) => self.retire(process, Some(err)),
        }
    }

    fn retire(&mut self, mut process: Process, err: Option<VmError>) {
        let pid = process.pid();
        if let Some(err) = &err {
            process.fail();
            error!(pid, error = %err, "process failed");
        } else {
            info!(pid, steps = process.steps(), "process finished");
        }
        self.reports.push(ProcessReport {
            pid,
            state: process.state(),
            steps: process.steps(),
            peak_call_depth: process.peak_call_depth(),
            error: err.map(|e| e.to_string()),
        });
    }
}

/// Run one compiled program to completion with the built-in natives.
pub fn run_program(program: Program, config: RuntimeConfig, sink: impl OutputSink + 'static) -> Result<RunReport, VmError> {
    let mut runtime = Runtime::new(config).with_sink(sink);
    runtime.spawn(program)?;
    Ok(runtime.run())
}
