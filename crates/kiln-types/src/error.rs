use crate::stage::StageKind;

/// The closed set of error kinds a `kiln` invocation can fail with.
/// Adding a variant here is a deliberate, reviewed change — phases
/// match on this enum exhaustively to decide propagation policy, so an
/// unmatched kind is a compile error, not a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KilnErrorKind {
    ConfigInvalid,
    SourceReadError,
    DockerfileAnalyzeError,
    /// Never raised by a correct implementation; indicates a programming
    /// bug in the signature engine.
    SignatureError,
    StoreUnavailable,
    /// Tag exists with a different content signature while strict policy is
    /// enabled.
    StoreConflict,
    RuntimeError,
    LockTimeout,
    /// Double-unlock or wrong-owner unlock. Fatal; never recovered from.
    LockMisuse,
    Cancelled,
    /// Internal signal consumed at a phase boundary; never observed by a
    /// caller outside the Conveyor.
    ResetRequired,
    PublishReportWriteError,
}

impl KilnErrorKind {
    /// Whether the Conveyor should abort the whole invocation on this kind,
    /// as opposed to handling it specially (`Cancelled` returns immediately,
    /// `ResetRequired` restarts signature+build for the affected image).
    pub fn aborts_invocation(self) -> bool {
        !matches!(self, KilnErrorKind::Cancelled | KilnErrorKind::ResetRequired)
    }

    pub fn is_fatal_programmer_error(self) -> bool {
        matches!(self, KilnErrorKind::LockMisuse | KilnErrorKind::SignatureError)
    }
}

impl std::fmt::Display for KilnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KilnErrorKind::ConfigInvalid => "config-invalid",
            KilnErrorKind::SourceReadError => "source-read-error",
            KilnErrorKind::DockerfileAnalyzeError => "dockerfile-analyze-error",
            KilnErrorKind::SignatureError => "signature-error",
            KilnErrorKind::StoreUnavailable => "store-unavailable",
            KilnErrorKind::StoreConflict => "store-conflict",
            KilnErrorKind::RuntimeError => "runtime-error",
            KilnErrorKind::LockTimeout => "lock-timeout",
            KilnErrorKind::LockMisuse => "lock-misuse",
            KilnErrorKind::Cancelled => "cancelled",
            KilnErrorKind::ResetRequired => "reset-required",
            KilnErrorKind::PublishReportWriteError => "publish-report-write-error",
        };
        write!(f, "{s}")
    }
}

/// One structured, user-visible failure: kind plus the image/stage context
/// it occurred in. Composes with `anyhow::Context` at call sites since it
/// implements [`std::error::Error`].
#[derive(Debug)]
pub struct KilnError {
    pub kind: KilnErrorKind,
    pub image_name: Option<String>,
    pub stage_kind: Option<StageKind>,
    pub detail: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl std::fmt::Display for KilnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)?;
        match (&self.image_name, self.stage_kind) {
            (Some(name), Some(stage)) => write!(f, " (image {name}, stage {stage:?})"),
            (Some(name), None) => write!(f, " (image {name})"),
            (None, _) => Ok(()),
        }
    }
}

impl std::error::Error for KilnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl KilnError {
    pub fn new(kind: KilnErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, image_name: None, stage_kind: None, detail: detail.into(), source: None }
    }

    pub fn with_image(mut self, image_name: impl Into<String>) -> Self {
        self.image_name = Some(image_name.into());
        self
    }

    pub fn with_stage(mut self, stage_kind: StageKind) -> Self {
        self.stage_kind = Some(stage_kind);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn cancelled() -> Self {
        Self::new(KilnErrorKind::Cancelled, "invocation cancelled")
    }

    pub fn reset_required(detail: impl Into<String>) -> Self {
        Self::new(KilnErrorKind::ResetRequired, detail)
    }
}
