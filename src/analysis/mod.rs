//! Token classification against configured target bands. Everything here
//! is pure: no I/O, deterministic for a given balance and configuration.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use crate::chain::ChainId;
use crate::config::TokenSettings;
use crate::error::AppResult;
use crate::ledger::{BalanceKey, TokenAddress};
use crate::providers::QuoteToken;
use crate::units::{mul_fraction, to_base_units};

/// Per-token targets in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub chain_id: ChainId,
    pub token: TokenAddress,
    pub decimals: u8,
    pub symbol: String,
    pub min_balance: U256,
    pub target_balance: U256,
    pub max_balance: U256,
}

impl TokenConfig {
    /// Converts whole-token settings to base units
    pub fn from_settings(settings: &TokenSettings) -> AppResult<Self> {
        Ok(Self {
            chain_id: settings.chain_id,
            token: settings.address.parse()?,
            decimals: settings.decimals,
            symbol: settings.symbol.clone(),
            min_balance: to_base_units(settings.min_balance, settings.decimals),
            target_balance: to_base_units(settings.target_balance, settings.decimals),
            max_balance: to_base_units(settings.max_balance, settings.decimals),
        })
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey {
            chain_id: self.chain_id,
            token: self.token,
        }
    }
}

/// Band widths as fractions of the target (0.1 = 10%)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub surplus: Decimal,
    pub deficit: Decimal,
    pub target_slippage: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Surplus,
    InRange,
    Deficit,
}

/// Acceptable balance range around the target once a rebalance lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBand {
    pub min: U256,
    pub max: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAnalysis {
    pub config: TokenConfig,
    pub balance: U256,
    pub state: TokenState,
    /// Distance from target, non-negative for every state
    pub diff: U256,
    pub target_band: TargetBand,
}

impl TokenAnalysis {
    pub fn key(&self) -> BalanceKey {
        self.config.key()
    }

    pub fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    pub fn to_quote_token(&self) -> QuoteToken {
        QuoteToken {
            chain_id: self.config.chain_id,
            token: self.config.token,
            decimals: self.config.decimals,
            symbol: self.config.symbol.clone(),
            balance: self.balance,
            target_balance: self.config.target_balance,
        }
    }
}

pub fn classify(config: &TokenConfig, balance: U256, thresholds: &Thresholds) -> TokenAnalysis {
    let target = config.target_balance;
    let surplus_line = mul_fraction(target, Decimal::ONE + thresholds.surplus);
    let deficit_line = mul_fraction(target, Decimal::ONE - thresholds.deficit);

    let (state, diff) = if balance >= surplus_line {
        (TokenState::Surplus, balance - target)
    } else if balance <= deficit_line {
        (TokenState::Deficit, target.saturating_sub(balance))
    } else if balance >= target {
        (TokenState::InRange, balance - target)
    } else {
        (TokenState::InRange, target - balance)
    };

    TokenAnalysis {
        config: config.clone(),
        balance,
        state,
        diff,
        target_band: TargetBand {
            min: mul_fraction(target, Decimal::ONE - thresholds.target_slippage),
            max: mul_fraction(target, Decimal::ONE + thresholds.target_slippage),
        },
    }
}

/// Largest distance first
pub fn sort_by_diff_desc(analyses: &mut [TokenAnalysis]) {
    analyses.sort_by_key(|a| Reverse(a.diff));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisGroups {
    pub surplus: Vec<TokenAnalysis>,
    pub in_range: Vec<TokenAnalysis>,
    pub deficit: Vec<TokenAnalysis>,
}

/// Splits by state, each group sorted largest diff first
pub fn group_by_state(analyses: Vec<TokenAnalysis>) -> AnalysisGroups {
    let mut groups = AnalysisGroups::default();
    for analysis in analyses {
        match analysis.state {
            TokenState::Surplus => groups.surplus.push(analysis),
            TokenState::InRange => groups.in_range.push(analysis),
            TokenState::Deficit => groups.deficit.push(analysis),
        }
    }
    sort_by_diff_desc(&mut groups.surplus);
    sort_by_diff_desc(&mut groups.in_range);
    sort_by_diff_desc(&mut groups.deficit);
    groups
}
