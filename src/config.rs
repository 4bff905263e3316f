//! Ambient configuration layer (SPEC_FULL §0): one `clap` derive struct
//! reading CLI flags with environment-variable fallbacks, the same
//! layering the teacher used informally in `KeeperConfig::
//! from_cli_and_deployment` (CLI override, then env var, then a
//! deployment-file default) — generalized here into `clap`'s built-in
//! `env` attribute instead of hand-rolled `std::env::var` chains, since
//! this agent has no single deployment-artifact file to fall back to.

use clap::Parser;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Off-chain fulfillment agent runtime for a USDC-paid, callback-style,
/// blockchain-backed API marketplace.
#[derive(Debug, Parser)]
#[command(name = "fulfillment-agent", version, about)]
pub struct Args {
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: u64,

    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,

    #[arg(long, env = "HUB_CONTRACT")]
    pub hub_contract: Address,

    #[arg(long, env = "KEEPALIVE_CONTRACT")]
    pub keepalive_contract: Address,

    /// Rewards are claimed through this contract (spec §4.8) and its
    /// stake/reputation/eligibility are read into the state cache (spec
    /// §4.9); absent, both degrade to a logged no-op (spec §6: "all
    /// optional except ADMIN_PRIVATE_KEY").
    #[arg(long, env = "STAKING_CONTRACT")]
    pub staking_contract: Option<Address>,

    #[arg(long, env = "USDC_CONTRACT")]
    pub usdc_contract: Option<Address>,

    #[arg(long, env = "BUYBACK_MODULE")]
    pub buyback_module: Option<Address>,

    #[arg(long, env = "PRICE_ORACLE")]
    pub price_oracle: Address,

    /// Swap target for the hook manager's rebalance pass (spec §4.8);
    /// absent, that tick logs a warning and disables its write path.
    #[arg(long, env = "TOKEN_CONTRACT")]
    pub token_contract: Option<Address>,

    #[arg(long, env = "SWAP_ROUTER")]
    pub swap_router: Option<Address>,

    /// Hex-encoded private key the agent signs and sends transactions
    /// with. Never logged; callers should prefer an env var over a CLI
    /// flag so it doesn't end up in shell history or `ps`.
    #[arg(long, env = "ADMIN_PRIVATE_KEY")]
    pub admin_private_key: String,

    #[arg(long, env = "STATE_DIR", default_value = "./state")]
    pub state_dir: PathBuf,

    #[arg(long, env = "START_BLOCK", default_value_t = 0)]
    pub start_block: u64,

    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 8)]
    pub max_concurrency: usize,

    #[arg(long, env = "GAS_BUFFER_PCT", default_value_t = 120)]
    pub gas_buffer_pct: u64,

    #[arg(long, env = "LOSS_TOLERANCE_UNITS", default_value_t = 5_000)]
    pub loss_tolerance_units: i128,

    #[arg(long, env = "ONCE", default_value_t = false)]
    pub once: bool,

    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    pub dry_run: bool,
}

/// Resolved, validated configuration derived from `Args`. Kept distinct
/// from `Args` the way the teacher kept `KeeperConfig` distinct from its
/// raw CLI struct: `Args` is what the user typed, `AgentConfig` is what
/// the rest of the program actually consumes.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub hub_contract: Address,
    pub keepalive_contract: Address,
    pub staking_contract: Option<Address>,
    pub usdc_contract: Option<Address>,
    pub buyback_module: Option<Address>,
    pub price_oracle: Address,
    pub token_contract: Option<Address>,
    pub swap_router: Option<Address>,
    pub admin_private_key: String,
    pub state_dir: PathBuf,
    pub start_block: u64,
    pub max_concurrency: usize,
    pub gas_buffer_pct: u64,
    pub loss_tolerance_units: i128,
    pub once: bool,
    pub dry_run: bool,
}

impl AgentConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.max_concurrency == 0 {
            return Err(eyre!("max concurrency must be > 0"));
        }
        if args.gas_buffer_pct < 100 {
            return Err(eyre!(
                "gas buffer pct must be >= 100 (100 means no buffer); got {}",
                args.gas_buffer_pct
            ));
        }

        if args.rpc_url.contains("alchemy.com/v2/") || args.rpc_url.contains("infura.io/v3/") {
            tracing::warn!(
                "RPC URL looks like it embeds an API key; prefer passing it via RPC_URL so it \
                 never lands in shell history"
            );
        }

        if args.staking_contract.is_none() {
            tracing::warn!("STAKING_CONTRACT not set; reward distribution will be a no-op");
        }
        if args.usdc_contract.is_none() {
            tracing::warn!("USDC_CONTRACT not set; startup USDC auto-approve is skipped");
        }
        if args.buyback_module.is_none() {
            tracing::warn!("BUYBACK_MODULE not set; this agent has no direct call surface against it regardless (the hub flushes to it on-chain)");
        }
        if args.swap_router.is_none() || args.token_contract.is_none() {
            tracing::warn!("SWAP_ROUTER/TOKEN_CONTRACT not fully set; hook manager rebalance will be a no-op");
        }

        Ok(Self {
            chain_id: args.chain_id,
            rpc_url: args.rpc_url,
            hub_contract: args.hub_contract,
            keepalive_contract: args.keepalive_contract,
            staking_contract: args.staking_contract,
            usdc_contract: args.usdc_contract,
            buyback_module: args.buyback_module,
            price_oracle: args.price_oracle,
            token_contract: args.token_contract,
            swap_router: args.swap_router,
            admin_private_key: args.admin_private_key,
            state_dir: args.state_dir,
            start_block: args.start_block,
            max_concurrency: args.max_concurrency,
            gas_buffer_pct: args.gas_buffer_pct,
            loss_tolerance_units: args.loss_tolerance_units,
            once: args.once,
            dry_run: args.dry_run,
        })
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            hub_contract: Address::zero(),
            keepalive_contract: Address::zero(),
            staking_contract: None,
            usdc_contract: None,
            buyback_module: None,
            price_oracle: Address::zero(),
            token_contract: None,
            swap_router: None,
            admin_private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
                .to_string(),
            state_dir: PathBuf::from("./state"),
            start_block: 0,
            max_concurrency: 8,
            gas_buffer_pct: 120,
            loss_tolerance_units: 5_000,
            once: false,
            dry_run: false,
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut args = base_args();
        args.max_concurrency = 0;
        assert!(AgentConfig::from_args(args).is_err());
    }

    #[test]
    fn sub_hundred_gas_buffer_is_rejected() {
        let mut args = base_args();
        args.gas_buffer_pct = 99;
        assert!(AgentConfig::from_args(args).is_err());
    }

    #[test]
    fn valid_args_produce_a_config() {
        let config = AgentConfig::from_args(base_args()).unwrap();
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.gas_buffer_pct, 120);
    }
}
