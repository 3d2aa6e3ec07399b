// src/ledger/fsm.rs

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 账本记录的生命周期状态。
/// created -> served -> {cpx|cpc|cpa}_reported，或 created -> no_bid。
/// 状态单调推进，终态之后不再变化。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Created,
    Served,
    NoBid,
    CpxReported,
    CpcReported,
    CpaReported,
}

impl LedgerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LedgerState::NoBid
                | LedgerState::CpxReported
                | LedgerState::CpcReported
                | LedgerState::CpaReported
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerState::Created => "created",
            LedgerState::Served => "served",
            LedgerState::NoBid => "no_bid",
            LedgerState::CpxReported => "cpx_reported",
            LedgerState::CpcReported => "cpc_reported",
            LedgerState::CpaReported => "cpa_reported",
        }
    }
}

/// 事件回调类型（/events/{cpx|cpc|cpa}）
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Cpx,
    Cpc,
    Cpa,
}

impl EventType {
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "cpx" => Some(EventType::Cpx),
            "cpc" => Some(EventType::Cpc),
            "cpa" => Some(EventType::Cpa),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Cpx => "cpx",
            EventType::Cpc => "cpc",
            EventType::Cpa => "cpa",
        }
    }

    pub fn reported_state(self) -> LedgerState {
        match self {
            EventType::Cpx => LedgerState::CpxReported,
            EventType::Cpc => LedgerState::CpcReported,
            EventType::Cpa => LedgerState::CpaReported,
        }
    }
}

/// 驱动状态推进的输入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInput {
    AuctionWon,
    AuctionNoBid,
    Event(EventType),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("invalid transition from {from} via {input}")]
    Invalid { from: &'static str, input: String },
    #[error("record already terminal in state {0}")]
    Terminal(&'static str),
}

pub fn transition(current: LedgerState, input: LedgerInput) -> Result<LedgerState, FsmError> {
    if current.is_terminal() {
        return Err(FsmError::Terminal(current.as_str()));
    }
    match (current, input) {
        (LedgerState::Created, LedgerInput::AuctionWon) => Ok(LedgerState::Served),
        (LedgerState::Created, LedgerInput::AuctionNoBid) => Ok(LedgerState::NoBid),
        (LedgerState::Served, LedgerInput::Event(event)) => Ok(event.reported_state()),
        (from, input) => Err(FsmError::Invalid {
            from: from.as_str(),
            input: format!("{:?}", input),
        }),
    }
}
