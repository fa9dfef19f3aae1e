// implementation of the sluice byte channel.
//
// the channel is a fixed-capacity ring buffer shared between exactly one
// logical reader and one logical writer, with suspension-based backpressure.
// the architecture is as such:
//
// ByteChannel handles wrap around Arc<shared state>
//                                       |
//        /------------------------------/
//        v
//     shared state
//        |
//        |------ an atomic state tag (state module) saying who currently has
//        |       the ring checked out: nobody, the reader, the writer, or
//        |       both at once. both at once is legal because the two sides
//        |       never touch overlapping bytes.
//        |
//        |------ a capacity tracker (capacity module): three atomic counters
//        |       implementing a claim/commit protocol over the ring's bytes.
//        |       this is what makes the no-mutex sharing sound.
//        |
//        |------ the ring itself (ring module), bound lazily on first write
//        |       and recycled through a process-wide pool (pool module) when
//        |       it drains.
//        |
//        \------ two waker slots (slot module), one per direction, parking
//                the at-most-one suspended operation per side.
//
// nothing in here takes a lock. every shared field is a single atomic word
// mutated through compare-and-swap retry loops.
//
// the organization of these modules is as such:
//
//      These are used like
//      library utilities:
//    /--------------------\
//
//      capacity<--------------core: This is the sin-eater of the unsafety. It
//                   |         ^     owns the critical sections, the cursor
//      ring<--------|         |     arithmetic, suspension, flush, and close,
//                   |         |     and is panicky about protocol violations.
//      pool<--------|         |
//                   |         |---join: ring-to-ring splicing of one channel
//      slot<--------|         |         into another.
//                   |         |
//      state<-------/         api: This is a wrapper around core that adapts
//                                  it into an API that is convenient and
//                                  typed. The crate re-exports this API
//                                  publically.
//
// there is also the error module, which contains the relevant error types,
// which is also re-exported publically.

pub(crate) mod error;
pub(crate) mod api;

mod capacity;
mod ring;
mod pool;
mod slot;
mod state;
mod core;
mod join;
