/*!

# Cargo Features

* **`persist`** (enabled by default): Enable the `covfuzz::persist` module, with
  an input queue and a coverage cache that are backed by files and recover their
  state when reopened.

Logging always goes through [the `log` crate](https://docs.rs/log). Install
whichever logger you like to see it; nothing is printed otherwise.

 */
