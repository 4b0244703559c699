#[cfg(test)]
mod tests_impl {
    use crate::core::iptables::{Chain, Family, Iptables, Table};
    use crate::core::rule::{Rule, Target};
    use crate::core::test_helpers::FakeIptables;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    fn owned(family: Family, table: Table) -> Chain {
        Chain::new(family, table, "NODEWALL_TEST")
    }

    fn drop_from(chain: &Chain, source: &str) -> Rule {
        Rule::new(chain.clone(), Target::Drop).source(source)
    }

    #[tokio::test]
    async fn test_ensure_chain_twice_leaves_one_chain() {
        for family in Family::iter() {
            for table in Table::iter() {
                let fake = FakeIptables::new();
                let ipt = Iptables::new(fake.clone());
                let chain = owned(family, table);

                ipt.ensure_chain(&chain).await.unwrap();
                ipt.ensure_chain(&chain).await.unwrap();

                assert!(fake.has_chain(family, table, "NODEWALL_TEST"));
                let creates = fake
                    .log()
                    .iter()
                    .filter(|l| l.ends_with("-N NODEWALL_TEST"))
                    .count();
                assert_eq!(creates, 1, "{family}/{table}");
            }
        }
    }

    #[tokio::test]
    async fn test_insert_first_is_idempotent() {
        let fake = FakeIptables::new();
        let ipt = Iptables::new(fake.clone());
        let chain = owned(Family::V4, Table::Filter);
        ipt.ensure_chain(&chain).await.unwrap();

        let rule = Rule::new(chain.clone(), Target::Drop)
            .module("conntrack")
            .option("--ctstate", "INVALID");
        ipt.insert_first(&rule).await.unwrap();
        assert_eq!(ipt.dump_chain(&chain).await.unwrap().len(), 1);

        ipt.insert_first(&rule).await.unwrap();
        let dump = ipt.dump_chain(&chain).await.unwrap();
        assert_eq!(dump, vec!["-A NODEWALL_TEST -m conntrack --ctstate INVALID -j DROP"]);
    }

    #[tokio::test]
    async fn test_delete_missing_rule_and_chain_succeeds() {
        let ipt = Iptables::new(FakeIptables::new());

        let present = owned(Family::V6, Table::Nat);
        ipt.ensure_chain(&present).await.unwrap();
        ipt.delete_rule(&drop_from(&present, "fd00::1")).await.unwrap();

        let missing = Chain::new(Family::V6, Table::Nat, "NODEWALL_MISSING");
        ipt.delete_rule(&drop_from(&missing, "fd00::1")).await.unwrap();

        let bad_target = Rule::new(present.clone(), Target::Chain("NODEWALL_NOWHERE".into()));
        ipt.delete_rule(&bad_target).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_first_orders_newest_first() {
        let ipt = Iptables::new(FakeIptables::new());
        let chain = owned(Family::V4, Table::Raw);
        ipt.ensure_chain(&chain).await.unwrap();

        ipt.insert_first(&drop_from(&chain, "10.0.0.1")).await.unwrap();
        ipt.insert_first(&drop_from(&chain, "10.0.0.2")).await.unwrap();

        let dump = ipt.dump_chain(&chain).await.unwrap();
        assert_eq!(
            dump,
            vec![
                "-A NODEWALL_TEST -s 10.0.0.2/32 -j DROP",
                "-A NODEWALL_TEST -s 10.0.0.1/32 -j DROP",
            ]
        );
    }

    #[tokio::test]
    async fn test_append_last_orders_oldest_first() {
        let ipt = Iptables::new(FakeIptables::new());
        let chain = owned(Family::V4, Table::Nat);
        ipt.ensure_chain(&chain).await.unwrap();

        ipt.append_last(&drop_from(&chain, "10.0.0.1")).await.unwrap();
        ipt.append_last(&drop_from(&chain, "10.0.0.2")).await.unwrap();

        let dump = ipt.dump_chain(&chain).await.unwrap();
        assert_eq!(
            dump,
            vec![
                "-A NODEWALL_TEST -s 10.0.0.1/32 -j DROP",
                "-A NODEWALL_TEST -s 10.0.0.2/32 -j DROP",
            ]
        );
    }

    #[tokio::test]
    async fn test_dumped_line_deletes_exactly_its_rule() {
        let ipt = Iptables::new(FakeIptables::new());
        let chain = owned(Family::V4, Table::Nat);
        ipt.ensure_chain(&chain).await.unwrap();

        let keep = Rule::new(chain.clone(), Target::MarkMasquerade)
            .owner("default/svc-b")
            .destination("10.0.0.6");
        let drop = Rule::new(chain.clone(), Target::Dnat("10.96.0.10".parse().unwrap()))
            .owner("default/svc-a")
            .destination("10.0.0.5");
        ipt.append_last(&keep).await.unwrap();
        ipt.append_last(&drop).await.unwrap();

        let dump = ipt.dump_chain(&chain).await.unwrap();
        let tokens = crate::core::codec::to_delete_args(&dump[1]);
        ipt.delete_rule_raw(Family::V4, Table::Nat, &tokens)
            .await
            .unwrap();

        assert!(ipt.rule_exists(&keep).await.unwrap());
        assert!(!ipt.rule_exists(&drop).await.unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_insert_first_twice_keeps_one_copy(a in 1u8..=254, b in 1u8..=254, prefix in 8u8..=32) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let ipt = Iptables::new(FakeIptables::new());
                let chain = owned(Family::V4, Table::Filter);
                ipt.ensure_chain(&chain).await.unwrap();
                let rule = drop_from(&chain, &format!("10.{a}.{b}.0/{prefix}"));

                ipt.insert_first(&rule).await.unwrap();
                ipt.insert_first(&rule).await.unwrap();

                assert_eq!(ipt.dump_chain(&chain).await.unwrap().len(), 1);
            });
        }
    }
}
