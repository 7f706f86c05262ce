use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::time::Duration;

fn netlink_error(action: &str, err: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(format!("netlink {}: {}", action, err)))
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use futures_util::stream::TryStreamExt;
    use netlink_packet_route::address::AddressAttribute;
    use netlink_packet_route::route::RouteScope;
    use rtnetlink::{new_connection, AddressMessageBuilder, Handle, LinkUnspec, RouteMessageBuilder};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Instant;
    use tokio::time::sleep;

    #[derive(Clone)]
    pub struct Netlink {
        handle: Handle,
    }

    impl Netlink {
        pub async fn new() -> Result<Self> {
            let (connection, handle, _) =
                new_connection().map_err(|err| netlink_error("connect", err))?;
            tokio::spawn(connection);
            Ok(Netlink { handle })
        }

        pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute();
            let link = links
                .try_next()
                .await
                .map_err(|err| netlink_error("get link", err))?;
            Ok(link.map(|link| link.header.index))
        }

        pub async fn wait_for_link(&self, name: &str, timeout: Duration) -> Result<u32> {
            let start = Instant::now();
            loop {
                // lookups of a name that is not registered yet fail with ENODEV
                if let Ok(Some(index)) = self.link_index(name).await {
                    return Ok(index);
                }
                if start.elapsed() > timeout {
                    return Err(netlink_error(
                        "wait for link",
                        format!("interface {} did not appear", name),
                    ));
                }
                sleep(Duration::from_millis(100)).await;
            }
        }

        pub async fn set_link_up(&self, index: u32) -> Result<()> {
            let link = LinkUnspec::new_with_index(index).up().build();
            self.handle
                .link()
                .set(link)
                .execute()
                .await
                .map_err(|err| netlink_error("set link up", err))
        }

        pub async fn set_link_mtu(&self, index: u32, mtu: u32) -> Result<()> {
            let link = LinkUnspec::new_with_index(index).mtu(mtu).build();
            self.handle
                .link()
                .set(link)
                .execute()
                .await
                .map_err(|err| netlink_error("set mtu", err))
        }

        pub async fn replace_address(&self, index: u32, address: IpAddr, prefix: u8) -> Result<()> {
            if let (IpAddr::V4(v4), 32) = (address, prefix) {
                // a stale broadcast attribute would survive the replace
                let del_msg = AddressMessageBuilder::<Ipv4Addr>::new()
                    .index(index)
                    .address(v4, prefix)
                    .build();
                let _ = self.handle.address().del(del_msg).execute().await;
            }

            let mut req = self.handle.address().add(index, address, prefix).replace();
            if let (IpAddr::V4(_), 32) = (address, prefix) {
                // rtnetlink always sets IFA_BROADCAST for IPv4; on a /32 it equals
                // the host address and echo requests get dropped as broadcast.
                req.message_mut().attributes.retain(|attr| {
                    !matches!(
                        attr,
                        AddressAttribute::Broadcast(_) | AddressAttribute::Address(_)
                    )
                });
            }
            req.execute()
                .await
                .map_err(|err| netlink_error("replace address", err))
        }

        /// Installs or replaces a link-scoped route for `prefix` via `index`.
        pub async fn replace_link_route(&self, prefix: IpNet, index: u32) -> Result<()> {
            let result = match prefix {
                IpNet::V4(net) => {
                    let route = RouteMessageBuilder::<Ipv4Addr>::new()
                        .destination_prefix(net.network(), net.prefix_len())
                        .output_interface(index)
                        .scope(RouteScope::Link)
                        .build();
                    self.handle.route().add(route).replace().execute().await
                }
                IpNet::V6(net) => {
                    let route = RouteMessageBuilder::<Ipv6Addr>::new()
                        .destination_prefix(net.network(), net.prefix_len())
                        .output_interface(index)
                        .scope(RouteScope::Link)
                        .build();
                    self.handle.route().add(route).replace().execute().await
                }
            };
            result.map_err(|err| netlink_error(&format!("replace route {}", prefix), err))
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    #[derive(Clone)]
    pub struct Netlink;

    fn unsupported() -> Error {
        Error::unsupported("netlink is only supported on linux")
    }

    impl Netlink {
        pub async fn new() -> Result<Self> {
            Err(unsupported())
        }

        pub async fn link_index(&self, _name: &str) -> Result<Option<u32>> {
            Err(unsupported())
        }

        pub async fn wait_for_link(&self, _name: &str, _timeout: Duration) -> Result<u32> {
            Err(unsupported())
        }

        pub async fn set_link_up(&self, _index: u32) -> Result<()> {
            Err(unsupported())
        }

        pub async fn set_link_mtu(&self, _index: u32, _mtu: u32) -> Result<()> {
            Err(unsupported())
        }

        pub async fn replace_address(
            &self,
            _index: u32,
            _address: IpAddr,
            _prefix: u8,
        ) -> Result<()> {
            Err(unsupported())
        }

        pub async fn replace_link_route(&self, _prefix: IpNet, _index: u32) -> Result<()> {
            Err(unsupported())
        }
    }
}

pub use imp::Netlink;
