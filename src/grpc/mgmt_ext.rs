use crate::grpc::mgmt::{LeaderQueryResp, RankResult, RanksResp};
use crate::models::{LeaderInfo, MemberResult};

impl From<MemberResult> for RankResult {
    fn from(result: MemberResult) -> Self {
        Self {
            rank: result.rank.0,
            errored: result.errored(),
            msg: result.error.unwrap_or_default(),
            state: result.state.to_string(),
        }
    }
}

impl RanksResp {
    /// Build a response from the given rank results, ordered by rank.
    pub fn from_results(mut results: Vec<MemberResult>) -> Self {
        results.sort_by_key(|result| result.rank);
        Self {
            results: results.into_iter().map(RankResult::from).collect(),
        }
    }
}

impl From<LeaderInfo> for LeaderQueryResp {
    fn from(info: LeaderInfo) -> Self {
        Self {
            current_leader: info.current_leader,
            replicas: info.replicas,
        }
    }
}
