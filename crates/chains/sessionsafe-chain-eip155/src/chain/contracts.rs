//! Contract interfaces touched during settlement.

use alloy_sol_types::sol;

sol!(
    /// Custody contract holding session collateral.
    #[allow(missing_docs)]
    #[derive(Debug)]
    interface ISessionSafe {
        function withdraw(uint256 amount) external;
    }

    #[allow(missing_docs)]
    #[derive(Debug)]
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
    }
);
