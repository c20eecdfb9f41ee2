//! `calc`: a tiny prefix-arithmetic runtime.
//!
//! Enough of a language to drive every part of the protocol: output, input, long running
//! evaluations with safe points, errors with and without restarts.
//!
//! ```text
//! (+ 1 (* 2 3))          ; 7
//! (setq x 10)            ; global variables
//! (print "hello")        ; output
//! (read-line)            ; input from the client
//! (sleep 5000)           ; interruptible pause, milliseconds
//! (error "boom")         ; condition without restarts
//! (cerror "boom")        ; condition with a CONTINUE restart
//! ```
use crate::runtime::{
    Binding, Condition, EvalContext, Frame, Location, RestartAction, Runtime, RuntimeRestart,
};
use crate::wire::{sexp, Sexp};
use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const SLEEP_CHUNK: Duration = Duration::from_millis(10);

/// Builtin functions with their argument lists.
const BUILTINS: &[(&str, &str)] = &[
    ("+", "(+ &rest numbers)"),
    ("-", "(- number &rest numbers)"),
    ("*", "(* &rest numbers)"),
    ("/", "(/ number &rest divisors)"),
    ("list", "(list &rest objects)"),
    ("progn", "(progn &rest forms)"),
    ("setq", "(setq name value)"),
    ("print", "(print object)"),
    ("read-line", "(read-line)"),
    ("sleep", "(sleep milliseconds)"),
    ("error", "(error message)"),
    ("cerror", "(cerror message)"),
];

#[derive(Default)]
pub struct Calc {
    globals: Mutex<HashMap<String, Sexp>>,
}

impl Calc {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Call in progress, used to build backtraces.
struct ActiveCall {
    form: String,
    args: Vec<Sexp>,
}

struct Interpreter<'a> {
    calc: &'a Calc,
    ctx: &'a mut dyn EvalContext,
    stack: Vec<ActiveCall>,
}

impl<'a> Interpreter<'a> {
    fn frames(&self) -> Vec<Frame> {
        self.stack
            .iter()
            .rev()
            .map(|call| Frame {
                description: call.form.clone(),
                locals: call
                    .args
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Binding {
                        name: format!("arg{i}"),
                        value: v.to_string(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Attach the current call stack to a condition that has none yet.
    fn trap(&self, condition: Condition) -> Condition {
        if condition.frames.is_empty() && !condition.is_cancelled() {
            condition.with_frames(self.frames())
        } else {
            condition
        }
    }

    fn eval(&mut self, expr: &Sexp) -> Result<Sexp, Condition> {
        match expr {
            Sexp::Nil | Sexp::Int(_) | Sexp::Str(_) | Sexp::Keyword(_) => Ok(expr.clone()),
            Sexp::Symbol(name) if name == "t" => Ok(expr.clone()),
            Sexp::Symbol(name) => {
                let value = self.calc.globals.lock().unwrap().get(name).cloned();
                value.ok_or_else(|| {
                    self.trap(
                        Condition::error(
                            "UNBOUND-VARIABLE",
                            format!("The variable {name} is unbound."),
                        )
                        .with_restart("RETRY", &format!("Retry using {name}."))
                        .with_restart("USE-VALUE", "Use 0 as the value of the form."),
                    )
                })
            }
            Sexp::List(items) => self.eval_call(expr, items),
        }
    }

    fn eval_call(&mut self, form: &Sexp, items: &[Sexp]) -> Result<Sexp, Condition> {
        self.ctx.check_interrupt().map_err(|c| self.trap(c))?;

        let Some(name) = items[0].as_symbol() else {
            return Err(self.trap(Condition::error(
                "PROGRAM-ERROR",
                format!("{} is not a function name", items[0]),
            )));
        };

        if name == "setq" {
            return match &items[1..] {
                [Sexp::Symbol(var), value] => {
                    let value = self.eval(value)?;
                    self.calc
                        .globals
                        .lock()
                        .unwrap()
                        .insert(var.clone(), value.clone());
                    Ok(value)
                }
                _ => Err(self.trap(Condition::error(
                    "PROGRAM-ERROR",
                    "setq expects a variable name and a value",
                ))),
            };
        }

        self.stack.push(ActiveCall {
            form: form.to_string(),
            args: vec![],
        });
        for arg in &items[1..] {
            let value = self.eval(arg)?;
            if let Some(call) = self.stack.last_mut() {
                call.args.push(value);
            }
        }
        let args = self
            .stack
            .last()
            .map(|call| call.args.clone())
            .unwrap_or_default();
        let result = self.apply(name, &args).map_err(|c| self.trap(c));
        // on error the stack is discarded together with the interpreter
        if result.is_ok() {
            self.stack.pop();
        }
        result
    }

    fn apply(&mut self, name: &str, args: &[Sexp]) -> Result<Sexp, Condition> {
        match name {
            "+" => ints(args)?
                .into_iter()
                .try_fold(0i64, |acc, i| acc.checked_add(i))
                .map(Sexp::Int)
                .ok_or_else(overflow),
            "*" => ints(args)?
                .into_iter()
                .try_fold(1i64, |acc, i| acc.checked_mul(i))
                .map(Sexp::Int)
                .ok_or_else(overflow),
            "-" => match ints(args)?.as_slice() {
                [] => Err(arity(name)),
                [single] => single.checked_neg().map(Sexp::Int).ok_or_else(overflow),
                [first, rest @ ..] => rest
                    .iter()
                    .try_fold(*first, |acc, i| acc.checked_sub(*i))
                    .map(Sexp::Int)
                    .ok_or_else(overflow),
            },
            "/" => match ints(args)?.as_slice() {
                [] => Err(arity(name)),
                [first, rest @ ..] => {
                    let mut acc = *first;
                    for divisor in rest {
                        if *divisor == 0 {
                            return Err(Condition::error(
                                "DIVISION-BY-ZERO",
                                "arithmetic error: division by zero",
                            ));
                        }
                        acc = acc.checked_div(*divisor).ok_or_else(overflow)?;
                    }
                    Ok(Sexp::Int(acc))
                }
            },
            "list" => Ok(Sexp::list(args.to_vec())),
            "progn" => Ok(args.last().cloned().unwrap_or(Sexp::Nil)),
            "print" => match args {
                [value] => {
                    let text = match value {
                        Sexp::Str(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.ctx.write_output(&format!("{text}\n"));
                    Ok(value.clone())
                }
                _ => Err(arity(name)),
            },
            "read-line" => match args {
                [] => self.ctx.read_string().map(Sexp::Str),
                _ => Err(arity(name)),
            },
            "sleep" => match ints(args)?.as_slice() {
                [ms] if *ms >= 0 => {
                    let mut left = Duration::from_millis(*ms as u64);
                    while !left.is_zero() {
                        self.ctx.check_interrupt()?;
                        let chunk = left.min(SLEEP_CHUNK);
                        thread::sleep(chunk);
                        left -= chunk;
                    }
                    Ok(Sexp::Nil)
                }
                _ => Err(arity(name)),
            },
            "error" => Err(Condition::error("SIMPLE-ERROR", message(args))),
            "cerror" => Err(Condition::error("SIMPLE-ERROR", message(args))
                .with_restart("CONTINUE", "Return nil from cerror.")),
            _ => Err(Condition::error(
                "UNDEFINED-FUNCTION",
                format!("The function {name} is undefined."),
            )),
        }
    }
}

fn ints(args: &[Sexp]) -> Result<Vec<i64>, Condition> {
    args.iter()
        .map(|arg| {
            arg.as_int().ok_or_else(|| {
                Condition::error("TYPE-ERROR", format!("The value {arg} is not an integer."))
            })
        })
        .collect()
}

fn overflow() -> Condition {
    Condition::error("ARITHMETIC-ERROR", "arithmetic error: integer overflow")
}

fn arity(name: &str) -> Condition {
    Condition::error(
        "PROGRAM-ERROR",
        format!("invalid number of arguments for {name}"),
    )
}

fn message(args: &[Sexp]) -> String {
    match args {
        [Sexp::Str(s)] => s.clone(),
        _ => args.iter().join(" "),
    }
}

impl Runtime for Calc {
    fn name(&self) -> &str {
        "calc"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn features(&self) -> Vec<String> {
        vec!["calc".to_string(), "integers".to_string()]
    }

    fn evaluate(
        &self,
        form: &str,
        _package: &str,
        ctx: &mut dyn EvalContext,
    ) -> Result<Sexp, Condition> {
        let expr = sexp::read(form)
            .map_err(|e| Condition::error("READER-ERROR", format!("read {form:?}: {e}")))?;

        let mut interpreter = Interpreter {
            calc: self,
            ctx,
            stack: vec![],
        };
        interpreter.eval(&expr)
    }

    fn invoke_restart(
        &self,
        condition: &Condition,
        index: usize,
    ) -> Result<RestartAction, Condition> {
        let Some(RuntimeRestart { name, .. }) = condition.restarts.get(index) else {
            return Err(Condition::error(
                "CONTROL-ERROR",
                format!("no restart {index} for {}", condition.type_name),
            ));
        };

        match name.as_str() {
            "RETRY" => Ok(RestartAction::Retry),
            "USE-VALUE" => Ok(RestartAction::Resume(Sexp::Int(0))),
            "CONTINUE" => Ok(RestartAction::Resume(Sexp::Nil)),
            other => Err(Condition::error(
                "CONTROL-ERROR",
                format!("restart {other} is not supported"),
            )),
        }
    }

    fn arglist(&self, name: &str) -> Option<String> {
        BUILTINS
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, arglist)| arglist.to_string())
    }

    fn find_definition(&self, name: &str) -> anyhow::Result<Location> {
        let line = BUILTINS
            .iter()
            .position(|(builtin, _)| *builtin == name)
            .ok_or_else(|| anyhow::anyhow!("no definition for {name}"))?;
        Ok(Location {
            file: "<calc builtins>".to_string(),
            line: line as u32 + 1,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    /// Evaluation context with canned input and recorded output.
    #[derive(Default)]
    struct Script {
        input: VecDeque<String>,
        output: String,
        interrupt_after: Option<usize>,
        checks: usize,
    }

    impl EvalContext for Script {
        fn write_output(&mut self, text: &str) {
            self.output.push_str(text);
        }

        fn read_string(&mut self) -> Result<String, Condition> {
            self.input.pop_front().ok_or_else(Condition::cancelled)
        }

        fn check_interrupt(&mut self) -> Result<(), Condition> {
            self.checks += 1;
            match self.interrupt_after {
                Some(n) if self.checks > n => Err(Condition::interrupt()),
                _ => Ok(()),
            }
        }
    }

    fn eval(calc: &Calc, form: &str) -> Result<Sexp, Condition> {
        calc.evaluate(form, "USER", &mut Script::default())
    }

    #[test]
    fn test_evaluate() {
        struct TestCase {
            form: &'static str,
            expected: Sexp,
        }
        let cases = vec![
            TestCase {
                form: "(+ 1 2)",
                expected: Sexp::Int(3),
            },
            TestCase {
                form: "(- 10 (* 2 3) 1)",
                expected: Sexp::Int(3),
            },
            TestCase {
                form: "(- 5)",
                expected: Sexp::Int(-5),
            },
            TestCase {
                form: "(/ 20 2 5)",
                expected: Sexp::Int(2),
            },
            TestCase {
                form: "(+)",
                expected: Sexp::Int(0),
            },
            TestCase {
                form: "(list 1 \"a\" (list))",
                expected: Sexp::List(vec![Sexp::Int(1), Sexp::string("a"), Sexp::Nil]),
            },
            TestCase {
                form: "(progn (setq x 4) (* x x))",
                expected: Sexp::Int(16),
            },
            TestCase {
                form: "\"text\"",
                expected: Sexp::string("text"),
            },
        ];

        let calc = Calc::new();
        for tc in cases {
            assert_eq!(eval(&calc, tc.form), Ok(tc.expected), "form: {}", tc.form);
        }
    }

    #[test]
    fn test_conditions() {
        let calc = Calc::new();

        let cond = eval(&calc, "(+ 1 (/ 1 0))").unwrap_err();
        assert_eq!(cond.type_name, "DIVISION-BY-ZERO");
        assert!(cond.description.contains("division by zero"));
        assert!(cond.restarts.is_empty());
        assert_eq!(cond.frames.len(), 2);
        assert_eq!(cond.frames[0].description, "(/ 1 0)");
        assert_eq!(cond.frames[1].description, "(+ 1 (/ 1 0))");
        assert_eq!(
            cond.frames[0].locals,
            vec![
                Binding {
                    name: "arg0".to_string(),
                    value: "1".to_string()
                },
                Binding {
                    name: "arg1".to_string(),
                    value: "0".to_string()
                },
            ]
        );

        let cond = eval(&calc, "(* 2 y)").unwrap_err();
        assert_eq!(cond.type_name, "UNBOUND-VARIABLE");
        assert_eq!(
            calc.invoke_restart(&cond, 0),
            Ok(RestartAction::Retry),
        );
        assert_eq!(
            calc.invoke_restart(&cond, 1),
            Ok(RestartAction::Resume(Sexp::Int(0))),
        );
        assert!(calc.invoke_restart(&cond, 2).is_err());

        let cond = eval(&calc, "(cerror \"careful\")").unwrap_err();
        assert_eq!(cond.description, "careful");
        assert_eq!(
            calc.invoke_restart(&cond, 0),
            Ok(RestartAction::Resume(Sexp::Nil))
        );

        let cond = eval(&calc, "(1 2)").unwrap_err();
        assert_eq!(cond.type_name, "PROGRAM-ERROR");
        let cond = eval(&calc, "(+ 1").unwrap_err();
        assert_eq!(cond.type_name, "READER-ERROR");
        let cond = eval(&calc, "(unknown 1)").unwrap_err();
        assert_eq!(cond.type_name, "UNDEFINED-FUNCTION");
    }

    #[test]
    fn test_io() {
        let calc = Calc::new();
        let mut script = Script {
            input: VecDeque::from(["hello".to_string()]),
            ..Script::default()
        };
        let result = calc.evaluate("(print (read-line))", "USER", &mut script);
        assert_eq!(result, Ok(Sexp::string("hello")));
        assert_eq!(script.output, "hello\n");
    }

    #[test]
    fn test_interrupt_at_safe_point() {
        let calc = Calc::new();
        let mut script = Script {
            interrupt_after: Some(3),
            ..Script::default()
        };
        let cond = calc
            .evaluate("(+ 1 (sleep 10000))", "USER", &mut script)
            .unwrap_err();
        assert_eq!(cond.kind, crate::runtime::ConditionKind::Interrupt);
        assert_eq!(cond.frames[0].description, "(sleep 10000)");
    }

    #[test]
    fn test_introspection() {
        let calc = Calc::new();
        assert_eq!(calc.arglist("+").as_deref(), Some("(+ &rest numbers)"));
        assert_eq!(calc.arglist("nope"), None);
        assert_eq!(calc.find_definition("+").unwrap().line, 1);
        assert!(calc.find_definition("nope").is_err());

        let cond = eval(&calc, "(+ 1 (/ 1 0))").unwrap_err();
        assert_eq!(
            calc.compute_backtrace(&cond, 1, 10).unwrap(),
            vec!["(+ 1 (/ 1 0))".to_string()]
        );
        assert_eq!(calc.frame_locals(&cond, 1).unwrap().len(), 1);
        assert!(calc.frame_locals(&cond, 5).is_err());
    }
}
