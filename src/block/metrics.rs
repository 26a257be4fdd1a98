use opentelemetry::{global, metrics::*};

/// Instruments of the storage node block manager
pub struct BlockManagerMetrics {
	pub(crate) bytes_read: Counter<u64>,
	pub(crate) block_read_duration: ValueRecorder<f64>,
	pub(crate) bytes_written: Counter<u64>,
	pub(crate) block_write_duration: ValueRecorder<f64>,
	pub(crate) delete_counter: Counter<u64>,

	pub(crate) corruption_counter: Counter<u64>,

	pub(crate) resync_counter: Counter<u64>,
	pub(crate) resync_error_counter: Counter<u64>,
	pub(crate) resync_duration: ValueRecorder<f64>,
	pub(crate) resync_send_counter: Counter<u64>,
	pub(crate) resync_recv_counter: Counter<u64>,
}

impl BlockManagerMetrics {
	pub fn new() -> Self {
		let meter = global::meter("silo_block/manager");
		Self {
			bytes_read: meter
				.u64_counter("block.bytes_read")
				.with_description("Number of bytes read from disk")
				.init(),
			block_read_duration: meter
				.f64_value_recorder("block.read_duration")
				.with_description("Duration of block read operations")
				.init(),
			bytes_written: meter
				.u64_counter("block.bytes_written")
				.with_description("Number of bytes written to disk")
				.init(),
			block_write_duration: meter
				.f64_value_recorder("block.write_duration")
				.with_description("Duration of block write operations")
				.init(),
			delete_counter: meter
				.u64_counter("block.delete_counter")
				.with_description("Number of blocks deleted")
				.init(),

			corruption_counter: meter
				.u64_counter("block.corruption_counter")
				.with_description("Data corruptions detected on block reads")
				.init(),

			resync_counter: meter
				.u64_counter("block.resync_counter")
				.with_description("Number of iterations of the resync loop")
				.init(),
			resync_error_counter: meter
				.u64_counter("block.resync_error_counter")
				.with_description("Number of resync iterations that returned an error")
				.init(),
			resync_duration: meter
				.f64_value_recorder("block.resync_duration")
				.with_description("Duration of resync iterations")
				.init(),
			resync_send_counter: meter
				.u64_counter("block.resync_send_counter")
				.with_description("Number of blocks sent to another node during resync")
				.init(),
			resync_recv_counter: meter
				.u64_counter("block.resync_recv_counter")
				.with_description("Number of blocks received from other nodes during resync")
				.init(),
		}
	}
}

impl Default for BlockManagerMetrics {
	fn default() -> Self {
		Self::new()
	}
}
