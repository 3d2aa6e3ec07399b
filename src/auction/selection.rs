// src/auction/selection.rs

use std::cmp::Ordering;

use crate::model::bid::BidSubmission;

/// 选择顺序：先比计价模型（CPA > CPC > CPX），同模型比价格（降序），
/// 再按出价方名称升序做确定性决胜。排第一的即胜者。
pub fn compare_bids(a: &BidSubmission, b: &BidSubmission) -> Ordering {
    a.pricing_model
        .priority()
        .cmp(&b.pricing_model.priority())
        .then_with(|| {
            b.price
                .partial_cmp(&a.price)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.bidder.cmp(&b.bidder))
}

pub fn select_winner(bids: &[BidSubmission]) -> Option<&BidSubmission> {
    bids.iter().min_by(|a, b| compare_bids(a, b))
}

/// 次价结算：按选择顺序排第二的出价的价格；只有一个出价时等于成交价
pub fn clearing_price(bids: &[BidSubmission], winner: &BidSubmission) -> f64 {
    let mut ranked: Vec<&BidSubmission> = bids.iter().collect();
    ranked.sort_by(|a, b| compare_bids(a, b));
    ranked.get(1).map(|b| b.price).unwrap_or(winner.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bid::PricingModel;
    use proptest::prelude::*;

    fn bid(bidder: &str, price: f64, model: PricingModel) -> BidSubmission {
        BidSubmission {
            auction_id: "ctx_1".to_string(),
            bidder: bidder.to_string(),
            price,
            pricing_model: model,
            creative: None,
            timestamp: "2026-08-02T10:00:00Z".to_string(),
            nonce: format!("n-{}", bidder),
            signature: String::new(),
        }
    }

    #[test]
    fn empty_bid_list_has_no_winner() {
        assert!(select_winner(&[]).is_none());
    }

    #[test]
    fn cpa_beats_cpc_regardless_of_price() {
        let bids = vec![
            bid("alpha", 1.0, PricingModel::CPC),
            bid("beta", 0.5, PricingModel::CPA),
        ];
        assert_eq!(select_winner(&bids).unwrap().bidder, "beta");
    }

    #[test]
    fn higher_price_wins_within_model() {
        let bids = vec![
            bid("alpha", 0.8, PricingModel::CPX),
            bid("beta", 1.2, PricingModel::CPX),
        ];
        assert_eq!(select_winner(&bids).unwrap().bidder, "beta");
    }

    #[test]
    fn name_breaks_exact_ties() {
        let bids = vec![
            bid("zeta", 1.0, PricingModel::CPC),
            bid("alpha", 1.0, PricingModel::CPC),
        ];
        assert_eq!(select_winner(&bids).unwrap().bidder, "alpha");
    }

    #[test]
    fn clearing_price_is_second_ranked() {
        let bids = vec![
            bid("alpha", 2.0, PricingModel::CPX),
            bid("beta", 1.5, PricingModel::CPX),
            bid("gamma", 1.0, PricingModel::CPX),
        ];
        let winner = select_winner(&bids).unwrap();
        assert_eq!(clearing_price(&bids, winner), 1.5);

        let solo = vec![bid("alpha", 2.0, PricingModel::CPX)];
        let winner = select_winner(&solo).unwrap();
        assert_eq!(clearing_price(&solo, winner), 2.0);
    }

    fn arb_model() -> impl Strategy<Value = PricingModel> {
        prop_oneof![
            Just(PricingModel::CPA),
            Just(PricingModel::CPC),
            Just(PricingModel::CPX),
        ]
    }

    fn arb_bid() -> impl Strategy<Value = BidSubmission> {
        ("[a-z]{3,10}", 0.0..100.0f64, arb_model())
            .prop_map(|(bidder, price, model)| bid(&bidder, price, model))
    }

    proptest! {
        /// 胜者在 (模型优先级, -价格, 名称) 的字典序下不被任何出价支配
        #[test]
        fn winner_ranks_highest(bids in prop::collection::vec(arb_bid(), 1..12)) {
            let winner = select_winner(&bids).unwrap();
            for other in &bids {
                prop_assert_ne!(
                    compare_bids(other, winner),
                    std::cmp::Ordering::Less,
                    "bid {} outranks selected winner {}",
                    other.bidder.clone(),
                    winner.bidder.clone()
                );
            }
        }

        /// 选择结果与出价到达顺序无关
        #[test]
        fn selection_is_order_independent(bids in prop::collection::vec(arb_bid(), 1..12)) {
            let mut reversed = bids.clone();
            reversed.reverse();
            let a = select_winner(&bids).unwrap();
            let b = select_winner(&reversed).unwrap();
            prop_assert_eq!(&a.bidder, &b.bidder);
            prop_assert_eq!(a.price, b.price);
        }
    }
}
