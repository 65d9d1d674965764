/// Process-wide knobs the core reads directly from the environment. The
/// CLI layer is responsible for setting these; the core only ever reads
/// them. Unknown variables are ignored — there is no validation step
/// that rejects an unrecognized `KILN_*`-shaped variable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Environment {
    /// `DEBUG_STAGE_DEPENDENCIES` — emit dependency-vector dumps for every
    /// stage as it is signed.
    pub debug_stage_dependencies: bool,
    /// `DISABLE_SYNC_LOCAL_STAGES_DATE_PERIOD_POLICY` — opt out of the
    /// age-based retention exclusion during sync.
    pub disable_sync_local_stages_date_period_policy: bool,
    /// `KEEP_STAGES_BUILT_WITHIN_LAST_N_HOURS` — `0` disables the policy
    /// entirely; `None` means the variable was unset (caller falls back to
    /// its own default).
    pub keep_stages_built_within_last_n_hours: Option<u64>,
}

impl Environment {
    /// Read the three variables this crate's consumers care about from the
    /// process environment. Malformed integers in
    /// `KEEP_STAGES_BUILT_WITHIN_LAST_N_HOURS` are treated as unset rather
    /// than a fatal *config-invalid* — the variable is advisory, not a
    /// required config surface.
    pub fn from_process_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| is_truthy(&v));
        Self {
            debug_stage_dependencies: flag("DEBUG_STAGE_DEPENDENCIES"),
            disable_sync_local_stages_date_period_policy: flag(
                "DISABLE_SYNC_LOCAL_STAGES_DATE_PERIOD_POLICY",
            ),
            keep_stages_built_within_last_n_hours: lookup("KEEP_STAGES_BUILT_WITHIN_LAST_N_HOURS")
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value, "" | "0" | "false" | "no")
}
