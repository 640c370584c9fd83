/// The persisted identity record of a local worker instance.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Superblock {
    /// The UUID of the instance.
    #[prost(string, required, tag = "1")]
    pub uuid: ::prost::alloc::string::String,
    /// The name of the system to which the instance belongs.
    #[prost(string, required, tag = "2")]
    pub system: ::prost::alloc::string::String,
    /// The rank assigned to the instance, absent until the instance has joined.
    #[prost(uint32, optional, tag = "3")]
    pub rank: ::core::option::Option<u32>,
}
