//! Exit codes for the CLI

use anvil_tasks::CommandResult;

/// Success
pub const SUCCESS: i32 = 0;

/// The command failed, or anvil itself hit an error
pub const ERROR: i32 = 1;

/// User cancelled
pub const CANCELLED: i32 = 130;

/// Exit code for a finished task
pub fn for_result(result: CommandResult) -> i32 {
    match result {
        CommandResult::Succeeded => SUCCESS,
        CommandResult::Failed => ERROR,
        CommandResult::Cancelled => CANCELLED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_result() {
        assert_eq!(for_result(CommandResult::Succeeded), 0);
        assert_eq!(for_result(CommandResult::Failed), 1);
        assert_eq!(for_result(CommandResult::Cancelled), 130);
    }
}
