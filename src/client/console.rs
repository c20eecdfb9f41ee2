//! Line oriented console client.
//!
//! Plain input is evaluated, at the debugger prompt of the focused worker if there is one.
//! Lines starting with `:` are console commands, see [`HELP`].
use crate::client::state::{DebuggerView, FrameKind};
use crate::client::{Client, ClientHook};
use crate::error::Error;
use crate::wire::{RequestId, ReturnValue, WorkerRef};
use crossterm::style::Stylize;
use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, ExternalPrinter as RLExternalPrinter};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

const PROMPT: &str = "slink> ";

pub const HELP: &str = "\
<form>        evaluate a form (at the focused debugger prompt, if any)
:r N          invoke restart N of the focused debugger
:bt           backtrace of the focused debugger
:locals N     local bindings of frame N
:c            continue, if the debugger offers it
:abort        leave the innermost debug level
:top          leave every debug level
:i            interrupt the running evaluation
:info         connection information
:help         this text
:q            quit";

/// Prints above the prompt without breaking the line being edited.
struct Printer {
    printer: Option<Mutex<Box<dyn RLExternalPrinter>>>,
}

unsafe impl Send for Printer {}
unsafe impl Sync for Printer {}

impl Printer {
    fn new(editor: &mut DefaultEditor) -> Self {
        let printer = editor
            .create_external_printer()
            .ok()
            .map(|p| Mutex::new(Box::new(p) as Box<dyn RLExternalPrinter>));
        Self { printer }
    }

    fn println(&self, msg: impl Display) {
        let msg = format!("{msg}\n");
        match &self.printer {
            Some(printer) => {
                if let Ok(mut printer) = printer.lock() {
                    _ = printer.print(msg);
                }
            }
            None => print!("{msg}"),
        }
    }

    fn error(&self, msg: impl Display) {
        self.println(format!("{}", msg.to_string().red()));
    }
}

enum Control {
    /// New line from the user
    Line(String),
    /// Ctrl-C at the prompt
    Interrupt,
    /// Terminate application
    Terminate,
}

struct ConsoleHook {
    printer: Arc<Printer>,
    focus: Arc<Mutex<Option<WorkerRef>>>,
    control_tx: SyncSender<Control>,
}

fn render_debugger(worker: WorkerRef, view: &DebuggerView) -> String {
    let mut out = format!(
        "{} {}\n{}\n",
        format!("Debugger level {} on worker {worker}:", view.level).bold(),
        view.description,
        "Restarts:".bold()
    );
    for (i, restart) in view.restarts.iter().enumerate() {
        out += &format!("  {i}: [{}] {}\n", restart.name.as_str().yellow(), restart.description);
    }
    out += &format!("{}", "Backtrace:".bold());
    for frame in &view.backtrace {
        out += &format!("\n  {}: {}", frame.index, frame.description);
    }
    out
}

impl ClientHook for ConsoleHook {
    fn on_return(&self, _worker: Option<WorkerRef>, _id: RequestId, value: &ReturnValue) {
        match value {
            ReturnValue::Ok(v) => self.printer.println(format!("=> {v}")),
            ReturnValue::Abort(Some(reason)) => self.printer.error(format!("; aborted: {reason}")),
            ReturnValue::Abort(None) => self.printer.println("; aborted"),
        }
    }

    fn on_debug_enter(&self, worker: WorkerRef, view: &DebuggerView) {
        *self.focus.lock().unwrap() = Some(worker);
        self.printer.println(render_debugger(worker, view));
    }

    fn on_debug_activate(&self, worker: WorkerRef, level: usize) {
        *self.focus.lock().unwrap() = Some(worker);
        self.printer
            .println(format!("; back in debugger level {level} on worker {worker}"));
    }

    fn on_debug_return(&self, worker: WorkerRef, level: usize) {
        if level == 1 {
            let mut focus = self.focus.lock().unwrap();
            if *focus == Some(worker) {
                *focus = None;
            }
        }
    }

    fn on_read_string(&self, worker: WorkerRef, _tag: u64) {
        self.printer
            .println(format!("; worker {worker} waits for input, the next line answers it"));
    }

    fn on_output(&self, text: &str) {
        self.printer.println(text.trim_end_matches('\n'));
    }

    fn on_read_aborted(&self, worker: WorkerRef, _tag: u64) {
        self.printer
            .println(format!("; worker {worker} no longer waits for input"));
    }

    fn on_debug_text(&self, worker: WorkerRef, text: &str) {
        self.printer.error(format!("; worker {worker}: {text}"));
    }

    fn on_background(&self, text: &str) {
        self.printer.error(format!("; {text}"));
    }

    fn on_disconnect(&self, error: Option<&Error>) {
        match error {
            Some(e) => self.printer.error(format!("; connection lost: {e}")),
            None => self.printer.println("; connection closed"),
        }
        _ = self.control_tx.try_send(Control::Terminate);
    }
}

pub struct Console {
    client: Client,
    package: String,
    printer: Arc<Printer>,
    focus: Arc<Mutex<Option<WorkerRef>>>,
    control_rx: Receiver<Control>,
}

impl Console {
    /// Connect to a server and run the console until the user quits or the connection is lost.
    pub fn run(addr: SocketAddr, package: &str) -> anyhow::Result<()> {
        let mut editor = DefaultEditor::new()?;
        let printer = Arc::new(Printer::new(&mut editor));
        let focus = Arc::default();
        let (control_tx, control_rx) = mpsc::sync_channel::<Control>(1);

        let hook = ConsoleHook {
            printer: printer.clone(),
            focus: Arc::clone(&focus),
            control_tx: control_tx.clone(),
        };
        let client = Client::connect(addr, Arc::new(hook))?;
        println!("connected to {addr}, :help for commands");

        thread::spawn(move || loop {
            match editor.readline(PROMPT) {
                Ok(input) => {
                    if input.trim() == ":q" {
                        _ = control_tx.send(Control::Terminate);
                        break;
                    }
                    _ = editor.add_history_entry(&input);
                    if control_tx.send(Control::Line(input)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    if control_tx.send(Control::Interrupt).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Eof) => {
                    _ = control_tx.send(Control::Terminate);
                    break;
                }
                Err(err) => {
                    println!("error: {:#}", err);
                    _ = control_tx.send(Control::Terminate);
                    break;
                }
            }
        });

        let console = Console {
            client,
            package: package.to_string(),
            printer,
            focus,
            control_rx,
        };
        console.event_loop();
        Ok(())
    }

    fn event_loop(self) {
        while let Ok(control) = self.control_rx.recv() {
            match control {
                Control::Line(line) => {
                    if let Err(e) = self.handle_line(line.trim()) {
                        self.printer.error(format!("error: {e}"));
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
                Control::Interrupt => {
                    if let Err(e) = self.interrupt() {
                        self.printer.error(format!("error: {e}"));
                    }
                }
                Control::Terminate => break,
            }
        }
        self.client.close();
    }

    /// Worker whose debugger prompt receives input.
    fn prompt_worker(&self) -> Option<WorkerRef> {
        let focus = *self.focus.lock().unwrap();
        self.client.with_state(|state| {
            focus
                .filter(|w| matches!(state.top(*w), FrameKind::Debugging(_)))
                .or_else(|| state.prompts().last().map(|(w, _)| *w))
        })
    }

    fn interrupt(&self) -> Result<(), Error> {
        let running = self.client.with_state(|state| {
            state
                .busy_workers()
                .into_iter()
                .rev()
                .find(|w| matches!(state.top(*w), FrameKind::Evaluating(_)))
        });
        match running {
            Some(worker) => {
                self.printer.println(format!("; interrupting worker {worker}"));
                self.client.interrupt(worker)
            }
            None => {
                self.printer.println("; nothing to interrupt");
                Ok(())
            }
        }
    }

    fn in_debugger(&self, form: impl Into<String>) -> Result<(), Error> {
        let worker = self
            .prompt_worker()
            .ok_or_else(|| Error::Request("no debugger is active".to_string()))?;
        self.client
            .evaluate(&form.into(), &self.package, Some(worker), None)?;
        Ok(())
    }

    fn handle_line(&self, line: &str) -> Result<(), Error> {
        if line.is_empty() {
            return Ok(());
        }

        let pending_read = self
            .client
            .with_state(|state| state.pending_reads().first().copied());
        if let Some((worker, tag)) = pending_read {
            return self.client.return_string(worker, tag, line);
        }

        let Some(command) = line.strip_prefix(':') else {
            let worker = self.prompt_worker();
            self.client.evaluate(line, &self.package, worker, None)?;
            return Ok(());
        };

        let mut args = command.split_whitespace();
        let name = args.next().unwrap_or_default();
        let number = |arg: Option<&str>| {
            arg.and_then(|a| a.parse::<usize>().ok())
                .ok_or_else(|| Error::Request(format!(":{name} expects a number")))
        };

        match name {
            "r" => {
                let index = number(args.next())?;
                let worker = self
                    .prompt_worker()
                    .ok_or_else(|| Error::Request("no debugger is active".to_string()))?;
                let level = self.client.with_state(|state| state.debug_level(worker));
                self.in_debugger(format!("(slink:invoke-restart {level} {index})"))
            }
            "bt" => self.in_debugger("(slink:backtrace 0)"),
            "locals" => {
                let frame = number(args.next())?;
                self.in_debugger(format!("(slink:frame-locals {frame})"))
            }
            "c" => self.in_debugger("(slink:continue)"),
            "abort" => self.in_debugger("(slink:abort)"),
            "top" => self.in_debugger("(slink:throw-to-toplevel)"),
            "i" => self.interrupt(),
            "info" => {
                self.client
                    .evaluate("(slink:connection-info)", &self.package, None, None)?;
                Ok(())
            }
            "help" => {
                self.printer.println(HELP);
                Ok(())
            }
            unknown => Err(Error::Request(format!("unknown command :{unknown}"))),
        }
    }
}
