//! Contract bindings for the external collaborators named in spec §6.
//!
//! ABI encoding/decoding itself is out of scope per spec §1 ("assumed
//! available as a library"); these `abigen!` blocks are exactly that
//! library, declared the same way the teacher declares `OpenSub` in
//! `opensub.rs` and `Erc20` in `erc20.rs` — one block per contract
//! family, only the methods this agent actually calls.

use ethers::contract::abigen;

abigen!(
    Hub,
    r#"[
        function getEndpointCount() view returns (uint256)
        function endpointIds(uint256 index) view returns (bytes32)
        function getEndpoint(bytes32 id) view returns (address owner, string url, string inputFormat, string outputFormat, uint256 baseCostUnits, uint256 maxResponseBytes, uint256 callbackGasLimit, uint256 estimatedGasCostWei, bool active, uint256 registeredAt)
        function getEthPrice() view returns (uint256)
        function estimateGasReimbursement(uint256 weiCost) view returns (uint256)
        function getEndpointPrice(bytes32 id) view returns (uint256)
        function getBalance(address account) view returns (uint256)
        function protocolFeesAccumulator() view returns (uint256)
        function getRequest(bytes32 requestId) view returns (bytes32 endpointId, address requester, address agent, uint256 totalCostUnits, uint256 baseCostUnits, uint256 markupUnits, uint256 gasReimbursementUnits, uint256 createdAt, uint8 status, bytes params, bytes response, bool hasCallback)
        function getCallback(bytes32 requestId) view returns (address target, uint256 gasLimit)
        function getAgentStats(address agent) view returns (uint256 fulfilled, uint256 cancelled, uint256 earned)
        function getHubStats() view returns (uint256 totalRequests, uint256 totalFulfilled, uint256 totalCancelled, uint256 servedRequestCounter)

        function depositUSDC(uint256 amount)
        function createRequest(bytes32 endpointId, bytes params) returns (bytes32)
        function createRequestWithCallback(bytes32 endpointId, bytes params) returns (bytes32)
        function fulfillRequest(bytes32 id, bytes response, bytes32 sessionId)
        function cancelRequest(bytes32 id)
        function flushProtocolFeesToBuyback()

        event RequestCreated(bytes32 indexed requestId, bytes32 indexed endpointId, address indexed requester, uint256 createdAt)
        event RequestFulfilled(bytes32 indexed requestId, address indexed agent, uint256 totalCostUnits)
        event RequestCancelled(bytes32 indexed requestId, address indexed canceller)
        event CallbackExecuted(bytes32 indexed requestId, bool success)
        event PriceOracleUpdated(uint256 newEthPrice)
        event EndpointUpdated(bytes32 indexed endpointId)
        event EndpointGasConfigUpdated(bytes32 indexed endpointId, uint256 estimatedGasCostWei)
    ]"#
);

abigen!(
    KeepAlive,
    r#"[
        function getSubscriptionCount() view returns (uint256)
        function subscriptionIds(uint256 index) view returns (bytes32)
        function getSubscription(bytes32 id) view returns (address consumer, address callbackTarget, uint256 callbackGasLimit, uint256 interval, uint256 feePerCycleUnits, uint256 estimatedGasCostWei, uint256 maxFulfillments, uint256 fulfillmentCount, uint256 lastFulfilledAt, bool active)
        function getSubscriptionCost(bytes32 id) view returns (uint256)
        function isReady(bytes32 id) view returns (bool)
        function getBalance(address account) view returns (uint256)
        function getEthPrice() view returns (uint256)
        function estimateGasReimbursement(uint256 weiCost) view returns (uint256)
        function getStats() view returns (uint256 totalSubscriptions, uint256 totalFulfillments, uint256 activeSubscriptions)

        function depositUSDC(uint256 amount)
        function createSubscription(address callbackTarget, uint256 callbackGasLimit, uint256 interval, uint256 feePerCycleUnits, uint256 maxFulfillments) returns (bytes32)
        function updateSubscription(bytes32 id, uint256 interval, uint256 feePerCycleUnits, uint256 maxFulfillments)
        function cancelSubscription(bytes32 id)
        function fulfill(bytes32 id)

        event SubscriptionCreated(bytes32 indexed subscriptionId, address indexed consumer)
        event SubscriptionFulfilled(bytes32 indexed subscriptionId, uint256 fulfillmentCount)
        event SubscriptionCancelled(bytes32 indexed subscriptionId)
    ]"#
);

abigen!(
    Staking,
    r#"[
        function getStakeInfo(address account) view returns (uint256 staked, uint256 since)
        function pendingRewards(address account) view returns (uint256)
        function totalStaked() view returns (uint256)
        function getReputation(address account) view returns (uint256)
        function isEligibleAgent(address account) view returns (bool)

        function stake(uint256 amount)
        function requestUnstake(uint256 amount)
        function withdraw()
        function claimRewards()
        function compound()
    ]"#
);

abigen!(
    SwapRouter,
    r#"[
        function swap(uint256 minMid) payable returns (uint256)
        function swapToToken(bytes32 poolKey, uint256 minMid, uint256 minOut, bool midIsToken0) payable returns (uint256)
    ]"#
);

abigen!(
    PriceOracle,
    r#"[
        function getEthPrice() view returns (uint256)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function allowance(address owner, address spender) view returns (uint256)
        function balanceOf(address owner) view returns (uint256)
        function approve(address spender, uint256 amount) returns (bool)
    ]"#
);
