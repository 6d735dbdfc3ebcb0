//! Generated gRPC contract for the bidirectional control stream, plus a
//! handful of conversions to/from `fleet-primitives` types so callers on
//! either side of the stream don't hand-roll proto construction.

pub mod convert;

pub mod proto {
    tonic::include_proto!("fleet.v1");
}

pub use proto::fleet_control_client::FleetControlClient;
pub use proto::fleet_control_server::{FleetControl, FleetControlServer};
pub use proto::{
    Ack, Capabilities, ClientEnvelope, CommandDispatchResult, CommandProto, CommandResultProto,
    ControlMessage, FleetStatusFilter, FleetStatusResponse, FleetSummary, GpuStatusProto, Heartbeat,
    LoadedModelProto, NodeStatusProto, NodeSummary, Ping, RegisterRequest, RegisterResponse,
    ResourcesProto, ServiceReportProto, ShutdownNotice, TargetedCommand,
};
