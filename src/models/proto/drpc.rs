/// A call made over a dRPC channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Call {
    /// The module to which the call is addressed.
    #[prost(int32, required, tag = "1")]
    pub module: i32,
    /// The method of the module being called.
    #[prost(int32, required, tag = "2")]
    pub method: i32,
    /// The sequence number of the call, echoed in the response.
    #[prost(int64, required, tag = "3")]
    pub sequence: i64,
    /// The encoded request payload.
    #[prost(bytes = "vec", required, tag = "4")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}
/// A response to a dRPC call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// The sequence number of the corresponding call.
    #[prost(int64, required, tag = "1")]
    pub sequence: i64,
    /// The status of the call.
    #[prost(int32, required, tag = "2")]
    pub status: i32,
    /// The encoded response payload.
    #[prost(bytes = "vec", required, tag = "3")]
    pub body: ::prost::alloc::vec::Vec<u8>,
}
/// The generic status payload returned by worker methods.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DaosResp {
    /// The status of the operation, zero on success.
    #[prost(int32, required, tag = "1")]
    pub status: i32,
}
