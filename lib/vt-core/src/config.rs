//! `AppConfig` (6): a hardcoded default, layered with an optional
//! `--vt_input_config`/`--vt_input_config_yaml` file, layered with
//! individual `--vt_*` CLI flags — each source overriding the last.
//! Grounded in the teacher's own `GameConfig` (a `serdeconv`-loaded TOML
//! struct with a hardcoded `Default`), generalized to three layers and a
//! `clap` CLI front end for the flag overlay.

use clap::{App, Arg, ArgMatches};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DebugLevel {
    Terse,
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub vt_color: bool,
    pub vt_quiet: bool,
    pub vt_no_sigint: bool,
    pub vt_no_sigsegv: bool,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            vt_color: true,
            vt_quiet: false,
            vt_no_sigint: false,
            vt_no_sigsegv: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    pub vt_trace: bool,
    pub vt_trace_file: Option<String>,
    pub vt_trace_dir: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> TracingConfig {
        TracingConfig {
            vt_trace: false,
            vt_trace_file: None,
            vt_trace_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub vt_debug_level: DebugLevel,
    pub vt_debug_handler: bool,
    pub vt_debug_term: bool,
    pub vt_debug_sched: bool,
}

impl Default for DebugConfig {
    fn default() -> DebugConfig {
        DebugConfig {
            vt_debug_level: DebugLevel::Normal,
            vt_debug_handler: false,
            vt_debug_term: false,
            vt_debug_sched: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    pub vt_lb: bool,
    pub vt_lb_name: Option<String>,
    pub vt_lb_data: bool,
    pub vt_lb_data_dir: String,
    pub vt_lb_data_file: String,
    pub vt_lb_interval: u64,
}

impl Default for LoadBalancingConfig {
    fn default() -> LoadBalancingConfig {
        LoadBalancingConfig {
            vt_lb: false,
            vt_lb_name: None,
            vt_lb_data: false,
            vt_lb_data_dir: ".".to_string(),
            vt_lb_data_file: "lb_data.%p.json".to_string(),
            vt_lb_interval: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    pub vt_no_detect_hang: bool,
    pub vt_hang_freq: u64,
    pub vt_epoch_graph_on_hang: bool,
    pub vt_term_rooted_use_ds: bool,
    pub vt_term_rooted_use_wave: bool,
}

impl Default for TerminationConfig {
    fn default() -> TerminationConfig {
        TerminationConfig {
            vt_no_detect_hang: false,
            vt_hang_freq: 1024,
            vt_epoch_graph_on_hang: false,
            vt_term_rooted_use_ds: false,
            vt_term_rooted_use_wave: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub vt_diag_enable: bool,
    pub vt_diag_summary_file: Option<String>,
}

impl Default for DiagnosticsConfig {
    fn default() -> DiagnosticsConfig {
        DiagnosticsConfig {
            vt_diag_enable: false,
            vt_diag_summary_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub vt_print_memory_each_phase: bool,
    pub vt_print_memory_node: i64,
}

impl Default for MemoryConfig {
    fn default() -> MemoryConfig {
        MemoryConfig {
            vt_print_memory_each_phase: false,
            vt_print_memory_node: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub vt_sched_num_progress: usize,
    pub vt_sched_progress_sec: f64,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            vt_sched_num_progress: 64,
            vt_sched_progress_sec: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub vt_max_mpi_send_size: usize,
    pub vt_no_assert_fail: bool,
    pub vt_throw_on_abort: bool,
    pub vt_pause: bool,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            vt_max_mpi_send_size: 1 << 30,
            vt_no_assert_fail: false,
            vt_throw_on_abort: false,
            vt_pause: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub output: OutputConfig,
    pub tracing: TracingConfig,
    pub debug: DebugConfig,
    pub lb: LoadBalancingConfig,
    pub term: TerminationConfig,
    pub diag: DiagnosticsConfig,
    pub mem: MemoryConfig,
    pub sched: SchedulerConfig,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    /// Layer 2: overlays a TOML or YAML file on top of the hardcoded
    /// default (`--vt_input_config[_yaml]=PATH`, 6).
    pub fn load_file<P: AsRef<Path>>(path: P, yaml: bool) -> AppConfig {
        if yaml {
            serdeconv::from_yaml_file(path.as_ref()).expect("error loading --vt_input_config_yaml")
        } else {
            serdeconv::from_toml_file(path.as_ref()).expect("error loading --vt_input_config")
        }
    }

    fn clap_app<'a, 'b>() -> App<'a, 'b> {
        App::new("vt")
            .arg(Arg::with_name("vt_input_config").long("vt_input_config").takes_value(true))
            .arg(Arg::with_name("vt_input_config_yaml").long("vt_input_config_yaml").takes_value(true))
            .arg(Arg::with_name("vt_quiet").long("vt_quiet"))
            .arg(Arg::with_name("vt_no_color").long("vt_no_color"))
            .arg(Arg::with_name("vt_max_mpi_send_size").long("vt_max_mpi_send_size").takes_value(true))
            .arg(Arg::with_name("vt_no_assert_fail").long("vt_no_assert_fail"))
            .arg(Arg::with_name("vt_throw_on_abort").long("vt_throw_on_abort"))
            .arg(Arg::with_name("vt_no_detect_hang").long("vt_no_detect_hang"))
            .arg(Arg::with_name("vt_hang_freq").long("vt_hang_freq").takes_value(true))
            .arg(Arg::with_name("vt_lb").long("vt_lb"))
            .arg(Arg::with_name("vt_lb_name").long("vt_lb_name").takes_value(true))
            .arg(Arg::with_name("vt_trace").long("vt_trace"))
            .arg(Arg::with_name("vt_help").long("vt_help"))
    }

    /// `initialize(argc, argv, comm[, config])` (6): consumes every
    /// `--vt_*` flag this process was launched with. Layer 3, applied on
    /// top of whichever base `AppConfig` layers 1 and 2 already produced.
    pub fn apply_cli<I, S>(mut self, args: I) -> AppConfig
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::clap_app().get_matches_from(args);
        self.apply_matches(&matches);
        self
    }

    fn apply_matches(&mut self, matches: &ArgMatches) {
        if matches.is_present("vt_quiet") {
            self.output.vt_quiet = true;
        }
        if matches.is_present("vt_no_color") {
            self.output.vt_color = false;
        }
        if let Some(v) = matches.value_of("vt_max_mpi_send_size") {
            self.runtime.vt_max_mpi_send_size = v.parse().expect("--vt_max_mpi_send_size must be an integer");
        }
        if matches.is_present("vt_no_assert_fail") {
            self.runtime.vt_no_assert_fail = true;
        }
        if matches.is_present("vt_throw_on_abort") {
            self.runtime.vt_throw_on_abort = true;
        }
        if matches.is_present("vt_no_detect_hang") {
            self.term.vt_no_detect_hang = true;
        }
        if let Some(v) = matches.value_of("vt_hang_freq") {
            self.term.vt_hang_freq = v.parse().expect("--vt_hang_freq must be an integer");
        }
        if matches.is_present("vt_lb") {
            self.lb.vt_lb = true;
        }
        if let Some(v) = matches.value_of("vt_lb_name") {
            self.lb.vt_lb_name = Some(v.to_string());
        }
        if matches.is_present("vt_trace") {
            self.tracing.vt_trace = true;
        }
    }

    /// The full three-layer resolution (6): hardcoded default, then an
    /// optional config file named on the command line, then every other
    /// `--vt_*` flag.
    pub fn resolve<I, S>(args: I) -> AppConfig
    where
        I: IntoIterator<Item = S> + Clone,
        S: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::clap_app().get_matches_from(args.clone());
        let mut config = if let Some(path) = matches.value_of("vt_input_config") {
            AppConfig::load_file(path, false)
        } else if let Some(path) = matches.value_of("vt_input_config_yaml") {
            AppConfig::load_file(path, true)
        } else {
            AppConfig::default()
        };
        config.apply_matches(&matches);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_max_send_size_matches_the_documented_default() {
        let config = AppConfig::default();
        assert_eq!(config.runtime.vt_max_mpi_send_size, 1 << 30);
    }

    #[test]
    fn cli_flags_override_the_hardcoded_default() {
        let config = AppConfig::default().apply_cli(vec!["vt", "--vt_no_detect_hang", "--vt_hang_freq", "10"]);
        assert!(config.term.vt_no_detect_hang);
        assert_eq!(config.term.vt_hang_freq, 10);
    }

    #[test]
    fn resolve_with_no_args_falls_back_to_the_hardcoded_default() {
        let config = AppConfig::resolve(vec!["vt"]);
        assert!(!config.output.vt_quiet);
        assert_eq!(config.sched.vt_sched_num_progress, 64);
    }
}
