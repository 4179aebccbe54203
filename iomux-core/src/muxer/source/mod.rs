pub(crate) mod endpoint;
pub(crate) mod transport;

pub enum EventStream<T> {
    Emit(T),
    Drained(SourceInstruction),
}

pub enum SourceInstruction {
    /// Nothing left for now; wait for the poller to report the source again.
    Reregister,
    /// The source is finished and must leave the poller.
    Deregister,
}
