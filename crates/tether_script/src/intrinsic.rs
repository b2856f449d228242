//! Minimal script globals: `console` and the timer functions.

use crate::convert::Function;
use crate::error::Result;
use crate::function::Rest;
use crate::realm::{Realm, RealmOption};
use crate::timer::{self, TimerId};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Severity of a console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        })
    }
}

type ConsoleSink = Arc<dyn Fn(ConsoleLevel, &str) + Send + Sync>;

/// `console.log/warn/error`, logged through `tracing` under the
/// `tether::console` target.
pub fn console() -> RealmOption {
    console_with(|level, line| match level {
        ConsoleLevel::Log => tracing::info!(target: "tether::console", "{line}"),
        ConsoleLevel::Warn => tracing::warn!(target: "tether::console", "{line}"),
        ConsoleLevel::Error => tracing::error!(target: "tether::console", "{line}"),
    })
}

/// `console` writing every line to `sink`.
pub fn console_with<F>(sink: F) -> RealmOption
where
    F: Fn(ConsoleLevel, &str) + Send + Sync + 'static,
{
    let sink: ConsoleSink = Arc::new(sink);
    RealmOption::new(move |realm| {
        let console = realm.new_object()?;
        for level in [ConsoleLevel::Log, ConsoleLevel::Warn, ConsoleLevel::Error] {
            let sink = Arc::clone(&sink);
            let func = realm.new_function(move |_: &Realm, _: Value, args: Rest<Value>| -> Result<()> {
                let parts = args.iter().map(Value::display).collect::<Result<Vec<_>>>()?;
                sink(level, &parts.join(" "));
                Ok(())
            })?;
            console.set(&level.to_string(), func)?;
        }
        realm.global_object()?.set("console", console)
    })
}

/// `setTimeout`, `setInterval`, `clearTimeout` and `clearInterval`, backed
/// by the runtime's timer table.
pub fn timers() -> RealmOption {
    RealmOption::new(|realm| {
        let global = realm.global_object()?;
        global.set(
            "setTimeout",
            realm.new_function(
                |realm: &Realm, _: Value, func: Function, ms: f64, args: Rest<Value>| -> Result<TimerId> {
                    realm
                        .runtime()
                        .set_timeout(&func, timer::millis(ms), args.into_inner())
                },
            )?,
        )?;
        global.set(
            "setInterval",
            realm.new_function(
                |realm: &Realm, _: Value, func: Function, ms: f64, args: Rest<Value>| -> Result<TimerId> {
                    realm
                        .runtime()
                        .set_interval(&func, timer::millis(ms), args.into_inner())
                },
            )?,
        )?;
        for name in ["clearTimeout", "clearInterval"] {
            global.set(
                name,
                realm.new_function(
                    |realm: &Realm, _: Value, ids: Rest<Option<i32>>| -> Result<()> {
                        match ids.first() {
                            Some(&Some(id)) => realm.runtime().clear_timer(id),
                            _ => Ok(()),
                        }
                    },
                )?,
            )?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalOptions;
    use crate::runtime::Runtime;
    use std::sync::Mutex;
    use tether_core::CancelToken;

    fn captured_console() -> (RealmOption, Arc<Mutex<Vec<(ConsoleLevel, String)>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let option = console_with(move |level, line| {
            sink.lock().unwrap().push((level, line.to_string()));
        });
        (option, lines)
    }

    #[test]
    fn console_joins_arguments() {
        let (console, lines) = captured_console();
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([console]).unwrap();
        realm
            .eval(
                "console.log('a', 1, true); console.warn([1, 2]); console.error()",
                EvalOptions::default(),
            )
            .unwrap();
        assert_eq!(
            *lines.lock().unwrap(),
            vec![
                (ConsoleLevel::Log, "a 1 true".to_string()),
                (ConsoleLevel::Warn, "1,2".to_string()),
                (ConsoleLevel::Error, String::new()),
            ]
        );
    }

    #[test]
    fn default_console_logs_through_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([console()]).unwrap();
        realm
            .eval("console.log('hello from script')", EvalOptions::default())
            .unwrap();
    }

    #[test]
    fn script_timers_drive_the_loop() {
        let (console, lines) = captured_console();
        let runtime = Runtime::builder().realm_option(timers()).build().unwrap();
        let realm = runtime.new_realm([console]).unwrap();
        realm
            .eval(
                r#"
                setTimeout((tag) => console.log(tag), 10, 'slow');
                setTimeout((tag) => console.log(tag), 5, 'fast');
                const dropped = setTimeout(() => console.log('never'), 1);
                clearTimeout(dropped);
                clearTimeout(dropped);
                clearTimeout();
                let n = 0;
                const every = setInterval(() => {
                    if (++n === 3) {
                        clearInterval(every);
                        console.log('interval done');
                    }
                }, 1);
                "#,
                EvalOptions::default(),
            )
            .unwrap();
        runtime.run_event_loop(&CancelToken::new(), false).unwrap();

        let lines: Vec<String> = lines.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
        assert!(!lines.contains(&"never".to_string()));
        let fast = lines.iter().position(|l| l == "fast").unwrap();
        let slow = lines.iter().position(|l| l == "slow").unwrap();
        assert!(fast < slow);
        assert!(lines.contains(&"interval done".to_string()));
    }

    #[test]
    fn set_timeout_requires_a_function() {
        let runtime = Runtime::new().unwrap();
        let realm = runtime.new_realm([timers()]).unwrap();
        let err = realm.eval("setTimeout(1, 1)", EvalOptions::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: parameter 1 is not of type 'function'"
        );
    }
}
