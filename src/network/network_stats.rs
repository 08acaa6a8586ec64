/// The `NetworkStats` struct contains statistics about the connection to a remote client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    /// The length of the queue containing inputs which have not yet been acknowledged by the remote client.
    /// The send queue will be longer than usual during high packet loss situations.
    pub send_queue_len: usize,
    /// The roundtrip packet transmission time in ms, as calculated from the periodic quality reports.
    pub ping: u128,
    /// The estimated bandwidth used between the two clients, in kilobytes per second.
    pub kbps_sent: usize,
    /// The number of frames the local client is behind the remote client at this instant in time.
    /// For example, if the local client is running frame 1002 and the remote client is running
    /// frame 1009, this value will roughly equal 7.
    pub local_frames_behind: i32,
    /// The same as `local_frames_behind`, but calculated from the perspective of the remote player.
    pub remote_frames_behind: i32,
}

impl NetworkStats {
    /// Creates a new `NetworkStats` instance with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
