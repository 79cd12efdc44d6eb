/*!

# How Inputs Are Generated

## Byte Buffers

A [`ByteArrayGenerator`][crate::ByteArrayGenerator] keeps a queue of seeds.
Every time it takes a seed from the queue it yields, in order:

1. the seed with 1, 2, and 4 consecutive bits flipped, at every bit offset;
2. the seed with 1, 2, and 4 consecutive bytes inverted, at every byte offset;
3. small additions and subtractions on 8, 16, and 32-bit values, in both
   endiannesses;
4. well-known boundary values written over 8, 16, and 32-bit values;
5. each dictionary token written at each offset;
6. `havoc_cycles` candidates with randomly stacked tweaks.

Candidates that an earlier stage already produced are skipped, so the
deterministic stages cost as little as they can.

When one of its candidates makes the target take a path that was never seen
before, the candidate becomes a new seed. Before each dequeue the queue is
culled: fast, short seeds that cover something no faster seed covers go first.

When the queue is empty the generator keeps going with havoc over the last
seed it took, so it never blocks.

## Combining Parameters

A [`ParamProvider`][crate::provider::ParamProvider] turns one generator per
parameter into tuples. The default,
[`Strategy::Suggested`][crate::provider::Strategy::Suggested], advances all
mutational generators together, enumerates every combination of up to five
small scalar tables, and randomly varies any remaining parameter one at a
time.

 */
