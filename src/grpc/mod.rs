mod mgmt {
    tonic::include_proto!("mgmt");
}
mod mgmt_ext;

pub type JoinState = mgmt::join_resp::State;

pub use mgmt::mgmt_client::MgmtClient;
pub use mgmt::mgmt_server::{Mgmt, MgmtServer};
pub use mgmt::*;
