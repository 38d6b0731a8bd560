pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# BLOCKFEED CONFIGURATION
# =============================================================================
# Blockfeed reads the console output of a blockchain node, extracts blocks,
# writes each one to the one-block store and streams them to subscribers.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/blockfeed/config.yml
#   3. /etc/blockfeed/config.yml
#
# Any value may reference an environment variable with $env{NAME}.

# =============================================================================
# INGESTOR
# =============================================================================

ingestor:
  # Where console lines come from: 'stdin', 'logs' or 'node'
  mode: stdin
  # Longest accepted console line in bytes. Longer lines stop ingestion.
  line_buffer_size: 10485760
  # Staging directory for one-block files before they are moved into the store
  working_dir: ./data/workdir
  # Block window. Blocks below start are dropped. Ingestion stops after the
  # stop block has been handled. 0 disables either bound.
  start_block_num: 0
  stop_block_num: 0
  # Queue sizes between the reader, the decoder and the fan-out stage
  lines_chan_capacity: 1024
  blocks_chan_capacity: 100

# =============================================================================
# LOGS (mode: logs)
# =============================================================================

logs:
  # Directory holding the node's log files
  dir: /var/log/node
  # File names to pick up; rotated files like node.log.1 are read oldest first
  pattern: '\.log(\.\d+)?$'
  # Keep watching for new lines and rotations after reaching the end
  follow: true
  poll_interval: 250ms

# =============================================================================
# NODE (mode: node)
# =============================================================================

node:
  path: /usr/local/bin/node
  # dir: /var/lib/node
  args: "--firehose-enabled"
  # KEY=VALUE pairs separated by spaces or commas
  env: ""
  # Only node stderr lines matching this regex are logged; unset logs them all
  # logs_filter: 'ERROR|WARN'
  # How long the node gets to exit on shutdown before it is killed
  shutdown_grace: 10s

# =============================================================================
# STORE
# =============================================================================

store:
  path: ./data/one-blocks
  # Optional tag appended to every one-block file name
  suffix: ""
  # Stop ingestion when a block cannot be written
  halt_on_error: false

# =============================================================================
# SERVER
# =============================================================================

server:
  listen: 127.0.0.1:9000
  # Blocks buffered per stream subscriber
  subscriber_buffer: 64
  # Time in-flight requests get to finish on shutdown
  drain_timeout: 5s
"#
    .to_string()
}
