use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern.
/// The string form doubles as the serde and storage representation.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(ReportKind {
    RoutineLab => "routine_lab",
    Microbiology => "microbiology",
    Examination => "examination",
    Pathology => "pathology",
});

impl ReportKind {
    pub const ALL: [ReportKind; 4] = [
        ReportKind::RoutineLab,
        ReportKind::Microbiology,
        ReportKind::Examination,
        ReportKind::Pathology,
    ];
}

str_enum!(ComparisonPeriod {
    OneMonth => "1month",
    ThreeMonths => "3months",
    SixMonths => "6months",
    OneYear => "1year",
    All => "all",
});

impl ComparisonPeriod {
    /// Lookback length in days. `None` means no lower bound.
    pub fn lookback_days(&self) -> Option<i64> {
        match self {
            Self::OneMonth => Some(30),
            Self::ThreeMonths => Some(90),
            Self::SixMonths => Some(180),
            Self::OneYear => Some(365),
            Self::All => None,
        }
    }

    /// Earliest eligible report date (inclusive) for a window anchored at `anchor`.
    pub fn lower_bound(&self, anchor: chrono::NaiveDate) -> Option<chrono::NaiveDate> {
        self.lookback_days()
            .and_then(|days| anchor.checked_sub_signed(chrono::Duration::days(days)))
    }
}

impl Default for ComparisonPeriod {
    fn default() -> Self {
        Self::SixMonths
    }
}

str_enum!(Confidence {
    High => "high",
    Medium => "medium",
    Low => "low",
    Unknown => "unknown",
});

impl Default for Confidence {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Confidence {
    /// Ordinal used to check that more extracted structure never lowers the tier.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

str_enum!(NarrativeType {
    Comparative => "comparative",
    FirstTimeAnalysis => "first_time_analysis",
    Unavailable => "unavailable",
    Skipped => "skipped",
});

str_enum!(FailureKind {
    ReasoningUnavailable => "reasoning_unavailable",
    ReasoningRejected => "reasoning_rejected",
    ContextOverflow => "context_overflow",
});

str_enum!(AbnormalFlag {
    Normal => "normal",
    Low => "low",
    High => "high",
    CriticalLow => "critical_low",
    CriticalHigh => "critical_high",
});

str_enum!(Interpretation {
    Susceptible => "susceptible",
    Intermediate => "intermediate",
    Resistant => "resistant",
});
