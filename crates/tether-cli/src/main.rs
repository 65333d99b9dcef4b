use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use anyhow::Context as _;
use tether::{
    BridgeError, Endpoint, EngineConfig, HostService, QuickJs, TracingListener,
    INBOUND_CHANNEL_NAME, OUTBOUND_CHANNEL_NAME,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Routes `console.*` through the outbound channel to the host `console` service.
const CONSOLE_PRELUDE: &str = r#"
globalThis.console = (function () {
  function format(value) {
    if (typeof value === "string") return value;
    var json = JSON.stringify(value);
    return json === undefined ? String(value) : json;
  }
  function send(level) {
    return function () {
      var parts = Array.prototype.map.call(arguments, format);
      tether_outboundChannel.invoke("console", level, parts);
    };
  }
  return { log: send("log"), info: send("info"), warn: send("warn"), error: send("error") };
})();
"#;

struct Options {
    script: PathBuf,
    memory_limit: Option<usize>,
    gc_threshold: Option<usize>,
    max_stack_size: Option<usize>,
    bytecode: bool,
    usage: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: tether <script.js> [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --memory-limit <bytes>     Engine heap limit [env: TETHER_MEMORY_LIMIT]");
            eprintln!("  --gc-threshold <bytes>     Allocation threshold for GC [env: TETHER_GC_THRESHOLD]");
            eprintln!("  --max-stack-size <bytes>   Engine stack limit [env: TETHER_MAX_STACK_SIZE]");
            eprintln!("  --bytecode                 Compile to bytecode, then execute it");
            eprintln!("  --usage                    Print engine memory usage after running");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(&options) {
        eprintln!("error: {e}");
        if let Some(stack) = e
            .downcast_ref::<BridgeError>()
            .and_then(BridgeError::as_js)
            .and_then(|js| js.stack())
        {
            eprintln!("{stack}");
        }
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut script: Option<PathBuf> = None;
    let mut options = Options {
        script: PathBuf::new(),
        memory_limit: None,
        gc_threshold: None,
        max_stack_size: None,
        bytecode: false,
        usage: false,
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--memory-limit" | "--gc-threshold" | "--max-stack-size") => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                let bytes = value
                    .parse::<usize>()
                    .map_err(|_| format!("{flag} expects a byte count, got '{value}'"))?;
                match flag {
                    "--memory-limit" => options.memory_limit = Some(bytes),
                    "--gc-threshold" => options.gc_threshold = Some(bytes),
                    _ => options.max_stack_size = Some(bytes),
                }
            }
            "--bytecode" => options.bytecode = true,
            "--usage" => options.usage = true,
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if script.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                script = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    options.script = script.ok_or("missing required argument: <script.js>")?;
    Ok(options)
}

/// Initialize tracing with TETHER_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("TETHER_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!("tether={base_level},tether_cli={base_level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(options: &Options) -> anyhow::Result<()> {
    let path = &options.script;
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let source_name = path.display().to_string();

    let mut config = EngineConfig::from_env()?;
    if let Some(bytes) = options.memory_limit {
        config = config.with_memory_limit(bytes);
    }
    if let Some(bytes) = options.gc_threshold {
        config = config.with_gc_threshold(bytes);
    }
    if let Some(bytes) = options.max_stack_size {
        config = config.with_max_stack_size(bytes);
    }

    let engine = QuickJs::with_config(&config)?;
    let peer = Rc::new(engine.deferred_inbound_channel(INBOUND_CHANNEL_NAME));
    let endpoint = Rc::new(Endpoint::new(peer).with_listener(Rc::new(TracingListener)));
    endpoint.bind("console", Rc::new(Console));
    engine.set_outbound_channel(OUTBOUND_CHANNEL_NAME, endpoint.clone())?;
    engine.evaluate(CONSOLE_PRELUDE, "tether:console")?;

    let result = if options.bytecode {
        let bytecode = engine.compile(&source, &source_name)?;
        tracing::info!(bytes = bytecode.as_bytes().len(), "Compiled {source_name}");
        engine.execute(&bytecode)?
    } else {
        engine.evaluate(&source, &source_name)?
    };
    println!("{}", serde_json::to_string_pretty(&result)?);

    match endpoint.client_names() {
        Ok(names) => tracing::info!(?names, "Script exposes services"),
        Err(BridgeError::MissingGlobal(_)) => {}
        Err(e) => tracing::warn!(error = %e, "Could not list script services"),
    }

    if options.usage {
        println!("{}", serde_json::to_string_pretty(&engine.memory_usage()?)?);
    }

    engine.close();
    Ok(())
}

/// Host side of the `console` object installed by [`CONSOLE_PRELUDE`].
struct Console;

impl HostService for Console {
    fn call(&self, function_name: &str, encoded_arguments: &[String]) -> anyhow::Result<Vec<String>> {
        let message = encoded_arguments.join(" ");
        match function_name {
            "log" | "info" => tracing::info!(target: "tether_cli::console", "{message}"),
            "warn" => tracing::warn!(target: "tether_cli::console", "{message}"),
            "error" => tracing::error!(target: "tether_cli::console", "{message}"),
            other => anyhow::bail!("console has no function {other}"),
        }
        Ok(Vec::new())
    }
}
